//! Inbound request dispatch: CoAP method + path + options → operation →
//! response, including blockwise-1 reassembly and the errno → response
//! code mapping.

use toad_msg::{Code, ContentFormat, MessageOptions, OptValue, Token, Type};

use crate::codec::link_format::{LinkFormatWriter, LinkMode};
use crate::codec::senml::RecordValue;
use crate::codec::{self, In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::engine::{Engine, Outgoing};
use crate::error::{Error, Pool};
use crate::msg::{self, code, Packet};
use crate::obj::{security, server};
use crate::path::{Level, Path, PathList};
use crate::platform::PlatformTypes;
use crate::registry::{attr::AttrKind, Perm, Registry};
use crate::value::{ResourceKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
  Read,
  CompositeRead,
  Discover,
  Write,
  CompositeWrite,
  WriteAttr,
  Execute,
  Create,
  Delete,
}

/// FETCH, iPATCH and (during bootstrap) GET / DELETE may legally arrive
/// without a URI path.
fn path_included(method: Code, bootstrap: bool) -> bool {
  if method == code::FETCH || method == code::IPATCH {
    return false;
  }
  if bootstrap && (method == code::GET || method == code::DELETE) {
    return false;
  }
  true
}

fn parse_segments(segments: &[&str]) -> Result<Path, Error> {
  if segments.len() > 4 {
    return Err(Error::NotFound);
  }

  let mut ids = [0u16; 4];
  for (i, seg) in segments.iter().enumerate() {
    ids[i] = seg.parse().map_err(|_| Error::NotFound)?;
  }

  Ok(match segments.len() {
       | 0 => Path::root(),
       | 1 => Path::object(ids[0]),
       | 2 => Path::instance(ids[0], ids[1]),
       | 3 => Path::resource(ids[0], ids[1], ids[2]),
       | _ => Path::resource_instance(ids[0], ids[1], ids[2], ids[3]),
     })
}

fn put_typed(writer: &mut dyn Writer,
             out: &mut OutBuf,
             path: &Path,
             value: &Value)
             -> Result<usize, Error> {
  match value {
    | Value::Opaque(b) => writer.put_opaque(out, path, b),
    | Value::String(s) => writer.put_string(out, path, s),
    | Value::U8(v) => writer.put_s16(out, path, *v as i16),
    | Value::U16(v) => writer.put_s32(out, path, *v as i32),
    | Value::U32(v) => writer.put_s64(out, path, *v as i64),
    | Value::U64(v) => writer.put_s64(out, path, *v as i64),
    | Value::S8(v) => writer.put_s8(out, path, *v),
    | Value::S16(v) => writer.put_s16(out, path, *v),
    | Value::S32(v) => writer.put_s32(out, path, *v),
    | Value::S64(v) => writer.put_s64(out, path, *v),
    | Value::Bool(v) => writer.put_bool(out, path, *v),
    | Value::Time(v) => writer.put_time(out, path, *v),
    | Value::Float(v) => writer.put_float(out, path, *v),
    | Value::ObjLnk(v) => writer.put_objlnk(out, path, *v),
  }
}

fn read_resource(registry: &mut Registry,
                 path: &Path,
                 writer: &mut dyn Writer,
                 out: &mut OutBuf,
                 num_read: &mut u8)
                 -> Result<(), Error> {
  let field = registry.field(path.obj, path.res).ok_or(Error::NotFound)?;
  if !field.perm.allows(Perm::R) {
    return Err(Error::NotAllowed);
  }
  let multi = field.multi > 1;

  writer.put_begin_r(out, path)?;

  if multi {
    let slots = registry.live_res_instance_ids(&Path::resource(path.obj, path.obj_inst, path.res));
    let wanted: Vec<u16> = match path.level {
      | Level::ResourceInstance => {
        if !slots.contains(&path.res_inst) {
          return Err(Error::NotFound);
        }
        vec![path.res_inst]
      },
      | _ => slots,
    };

    if wanted.is_empty() {
      return Err(Error::NotFound);
    }

    writer.put_begin_ri(out, path)?;
    for ri in wanted {
      let rip = Path::resource_instance(path.obj, path.obj_inst, path.res, ri);
      let value = registry.read_with_hook(&rip)?;
      put_typed(writer, out, &rip, &value)?;
      *num_read += 1;
    }
    writer.put_end_ri(out, path)?;
  } else {
    let rp = Path::resource(path.obj, path.obj_inst, path.res);
    let value = registry.read_with_hook(&rp)?;
    put_typed(writer, out, &rp, &value)?;
    *num_read += 1;
  }

  writer.put_end_r(out, path)?;
  Ok(())
}

fn read_instance(registry: &mut Registry,
                 path: &Path,
                 inst: u16,
                 writer: &mut dyn Writer,
                 out: &mut OutBuf,
                 num_read: &mut u8)
                 -> Result<(), Error> {
  let ipath = Path::instance(path.obj, inst);
  writer.put_begin_oi(out, &ipath)?;

  let single = path.level >= Level::Resource;
  let res_ids = if single {
    vec![path.res]
  } else {
    registry.resource_ids(path.obj, inst)
  };

  for res in res_ids {
    let mut rpath = Path::resource(path.obj, inst, res);
    if path.level == Level::ResourceInstance {
      rpath = *path;
    }

    match read_resource(registry, &rpath, writer, out, num_read) {
      | Ok(()) => {},
      | Err(Error::NoMem(p)) => return Err(Error::NoMem(p)),
      | Err(e) if single => return Err(e),
      // enumerating: unreadable or empty resources are skipped
      | Err(_) => {},
    }
  }

  writer.put_end_oi(out, &ipath)?;
  Ok(())
}

/// Serialize the subtree at `path` — the READ operation and the body of
/// every notification.
///
/// At object level every instance is enumerated; "nothing matched" is an
/// error only when the request named a single resource (or resource
/// instance).
pub(crate) fn read_to_payload(registry: &mut Registry,
                              path: &Path,
                              writer: &mut dyn Writer,
                              out: &mut OutBuf)
                              -> Result<u8, Error> {
  let instances: Vec<u16> = match path.level {
    | Level::Root => return Err(Error::Invalid),
    | Level::Object => registry.instance_ids(path.obj),
    | _ => {
      registry.instance(path.obj, path.obj_inst)
              .ok_or(Error::NotFound)?;
      vec![path.obj_inst]
    },
  };

  if path.level == Level::Object && registry.object(path.obj).is_none() {
    return Err(Error::NotFound);
  }

  writer.put_begin(out, path)?;
  let mut num_read = 0u8;
  for inst in instances {
    read_instance(registry, path, inst, writer, out, &mut num_read)?;
  }
  writer.put_end(out, path)?;

  if num_read == 0 && path.level >= Level::Resource {
    return Err(Error::NotFound);
  }

  Ok(num_read)
}

/// Serialize a composite path list: unresolvable paths are skipped, the
/// root path expands to everything except Security.
pub(crate) fn composite_read_to_payload(registry: &mut Registry,
                                        list: &PathList,
                                        writer: &mut dyn Writer,
                                        out: &mut OutBuf)
                                        -> Result<u8, Error> {
  writer.put_begin(out, &Path::root())?;

  let mut num_read = 0u8;
  for path in list.iter() {
    if path.level == Level::Root {
      let objs: Vec<u16> = registry.objects()
                                   .iter()
                                   .map(|o| o.id())
                                   .filter(|id| *id != security::OBJECT_ID)
                                   .collect();
      for obj in objs {
        for inst in registry.instance_ids(obj) {
          let p = Path::object(obj);
          read_instance(registry, &p, inst, writer, out, &mut num_read)?;
        }
      }
      continue;
    }

    let instances: Vec<u16> = match path.level {
      | Level::Object => registry.instance_ids(path.obj),
      | _ if registry.instance(path.obj, path.obj_inst).is_some() => vec![path.obj_inst],
      | _ => continue,
    };

    for inst in instances {
      match read_instance(registry, path, inst, writer, out, &mut num_read) {
        | Ok(()) => {},
        | Err(Error::NoMem(p)) => return Err(Error::NoMem(p)),
        | Err(_) => {},
      }
    }
  }

  writer.put_end(out, &Path::root())?;
  Ok(num_read)
}

fn parse_path_list(format: ContentFormat,
                   payload: &[u8],
                   capacity: usize)
                   -> Result<PathList, Error> {
  let mut list = PathList::new(capacity);
  if format == codec::APP_SENML_JSON {
    codec::senml_json::parse_paths(payload, &mut list)?;
  } else if format == codec::APP_SENML_CBOR {
    codec::senml_cbor::parse_paths(payload, &mut list)?;
  } else {
    log::error!("unsupported content-format for composite: {:?}", format);
    return Err(Error::UnsupportedFormat);
  }
  Ok(list)
}

fn parse_records(format: ContentFormat,
                 payload: &[u8],
                 base: &Path)
                 -> Result<Vec<(Path, Option<RecordValue>)>, Error> {
  if format == codec::APP_SENML_JSON {
    return codec::senml_json::parse(payload);
  }
  if format == codec::APP_SENML_CBOR {
    return codec::senml_cbor::parse(payload);
  }
  if format == codec::OMA_TLV || format == codec::OMA_OLD_TLV {
    let mut records = vec![];
    for (path, raw) in codec::oma_tlv::decode(payload, base)? {
      records.push((path, Some(RecordValue::Opaque(raw.to_vec()))));
    }
    return Ok(records);
  }

  Err(Error::UnsupportedFormat)
}

impl<P: PlatformTypes> Engine<P> {
  /// Serve one server-initiated request, yielding the response to queue
  /// (`None` only when the request is so broken no response applies).
  pub(crate) fn handle_request(&mut self, request: Packet, now: u64) -> Option<Outgoing> {
    let mid = request.id;
    let token = request.token;

    match self.dispatch(&request, now) {
      | Ok(outgoing) => Some(outgoing),
      | Err(e) => {
        log::debug!("request failed: {:?} -> {}",
                    e,
                    String::from_iter(e.response_code().to_human()));
        msg::free_block_ctx(&mut self.block1, token);
        let response = Packet::new(Type::Ack, e.response_code(), mid, token);
        Some(Outgoing::new(response, None))
      },
    }
  }

  fn dispatch(&mut self, request: &Packet, now: u64) -> Result<Outgoing, Error> {
    let mid = request.id;
    let token = request.token;
    let method = request.code;
    let bootstrap = self.ctx.bootstrap_mode;

    let mut segments: Vec<&str> = request.path().map_err(|_| Error::BadRequest)?;
    if segments.len() == 1 && segments[0].is_empty() {
      segments.clear();
    }

    // bootstrap-finish comes in on its own resource
    if method == code::POST && segments.len() == 1 && segments[0] == "bs" {
      self.bootstrap_finish();
      return Ok(Outgoing::new(Packet::new(Type::Ack, code::CHANGED, mid, token), None));
    }

    if segments.is_empty() && path_included(method, bootstrap) {
      return Err(Error::NotAllowed);
    }

    let path = parse_segments(&segments)?;

    let format = request.content_format();
    let accept = request.accept()
                        .unwrap_or_else(|| codec::default_accept(self.config.version));

    if path_included(method, bootstrap) && !(bootstrap && path.level == Level::Root) {
      self.registry.object(path.obj).ok_or(Error::NotFound)?;
    }

    let (op, mut rsp_code) = if method == code::GET {
      if accept == codec::APP_LINK_FORMAT {
        (Op::Discover, code::CONTENT)
      } else {
        (Op::Read, code::CONTENT)
      }
    } else if method == code::FETCH {
      (Op::CompositeRead, code::CONTENT)
    } else if method == code::IPATCH {
      (Op::CompositeWrite, code::CHANGED)
    } else if method == code::POST {
      match path.level {
        | Level::Object => (Op::Create, code::CREATED),
        | Level::ObjectInstance => (Op::Write, code::CHANGED),
        | Level::Resource | Level::ResourceInstance => (Op::Execute, code::CHANGED),
        | Level::Root => return Err(Error::NotAllowed),
      }
    } else if method == code::PUT {
      match format {
        | None => (Op::WriteAttr, code::CHANGED),
        | Some(_) => (Op::Write, code::CHANGED),
      }
    } else if method == code::DELETE {
      (Op::Delete, code::DELETED)
    } else {
      return Err(Error::NotAllowed);
    };

    let observe = MessageOptions::get(request, toad_msg::no_repeat::OBSERVE).and_then(|vs| vs.get(0))
                                                                            .map(|v| {
                                                                              msg::decode_uint_option(&v.0)
                                                                            });

    // blockwise-1 bookkeeping (part 1)
    let mut ignore = false;
    let mut last_block = true;
    let mut block_idx = None;
    if let Some(block) = request.block1() {
      last_block = !block.more();

      if !last_block && (block.size() as usize) > request.payload.0.len() {
        log::debug!("trailing payload is discarded!");
        return Err(Error::TooLarge);
      }

      let num = block.num();
      let idx = match msg::get_block_ctx(&mut self.block1, token, now) {
        | Some(i) => i,
        | None if num == 0 => {
          let i = msg::init_block_ctx(&mut self.block1,
                                      self.config.tables.block1_contexts,
                                      token,
                                      now)?;
          if let Some(total) = request.size1() {
            self.block1[i].total_size = total as usize;
          }
          i
        },
        | None => {
          log::error!("cannot find block context");
          return Err(Error::NotFound);
        },
      };

      let ctx = &mut self.block1[idx];
      if num < ctx.expected {
        log::warn!("block already handled {}, expected {}", num, ctx.expected);
        ignore = true;
      } else if num > ctx.expected {
        log::warn!("block out of order {}, expected {}", num, ctx.expected);
        msg::free_block_ctx(&mut self.block1, token);
        return Err(Error::Incomplete);
      } else {
        ctx.last_block = last_block;
        ctx.expected += 1;
      }

      block_idx = Some(idx);
      if !last_block {
        rsp_code = code::CONTINUE;
      }
    }

    // a handler that can't answer before the peer would retransmit gets an
    // early empty ACK and a promoted (separate CON) response
    let promote = matches!(op, Op::Read | Op::Write | Op::Execute)
                  && path.level >= Level::Resource
                  && self.registry.wants_separate_response(&path);
    if promote {
      self.send_empty_ack(mid);
    }

    let mut response = Packet::new(Type::Ack, rsp_code, mid, token);

    if !ignore {
      match op {
        | Op::Read => self.op_read(&mut response, &path, accept, observe, token, now)?,
        | Op::CompositeRead => {
          self.op_composite_read(&mut response,
                                 format.unwrap_or(accept),
                                 accept,
                                 &request.payload.0,
                                 observe,
                                 token,
                                 now)?
        },
        | Op::Discover => self.op_discover(&mut response, &path)?,
        | Op::Write => self.op_write(&path, format, &request.payload.0, block_idx, last_block)?,
        | Op::CompositeWrite => {
          self.op_composite_write(format.ok_or(Error::UnsupportedFormat)?, &request.payload.0)?
        },
        | Op::WriteAttr => self.op_write_attr(&path, request)?,
        | Op::Execute => self.op_execute(&path, &request.payload.0, now)?,
        | Op::Create => self.op_create(&path, format, &request.payload.0)?,
        | Op::Delete => self.op_delete(&path, now)?,
      }
    }

    // blockwise-1 (part 2): echo the option, free the context when done
    if let Some(block) = request.block1() {
      if last_block {
        msg::free_block_ctx(&mut self.block1, token);
      } else {
        response.set_block1(block.size(), block.num(), true)
                .map_err(|_| Error::NoMem(Pool::Payload))?;
      }
    }

    let mut outgoing = Outgoing::new(response, None);
    outgoing.promote = promote;
    Ok(outgoing)
  }

  fn op_read(&mut self,
             response: &mut Packet,
             path: &Path,
             accept: ContentFormat,
             observe: Option<u32>,
             token: Token,
             now: u64)
             -> Result<(), Error> {
    match observe {
      | Some(0) => {
        if token.0.is_empty() {
          log::error!("observe request missing token");
          return Err(Error::Invalid);
        }

        self.add_observer(token, *path, accept, now)?;
        MessageOptions::set(response,
                            toad_msg::no_repeat::OBSERVE,
                            OptValue(msg::encode_uint_option(0).into_iter().collect()))
                      .map_err(|_| Error::NoMem(Pool::Payload))?;
      },
      | Some(1) => {
        if self.remove_observer_by_token(token).is_err() {
          // peers may cancel with a fresh token; fall back to the path
          if let Err(e) = self.remove_observer_by_path(path) {
            log::error!("remove observe error: {:?}", e);
          }
        }
      },
      | Some(_) => return Err(Error::Invalid),
      | None => {},
    }

    let mut writer = codec::select_writer(accept)?;
    let mut out = OutBuf::new(self.config.transfer.max_payload);
    read_to_payload(&mut self.registry, path, writer.as_mut(), &mut out)?;

    response.set_content_format(accept)
            .map_err(|_| Error::NoMem(Pool::Payload))?;
    response.payload = toad_msg::Payload(out.into_vec());
    Ok(())
  }

  fn op_composite_read(&mut self,
                       response: &mut Packet,
                       parse_format: ContentFormat,
                       accept: ContentFormat,
                       payload: &[u8],
                       observe: Option<u32>,
                       token: Token,
                       now: u64)
                       -> Result<(), Error> {
    if accept != codec::APP_SENML_JSON && accept != codec::APP_SENML_CBOR {
      return Err(Error::UnsupportedFormat);
    }

    let list = parse_path_list(parse_format, payload, self.config.tables.composite_paths)?;

    match observe {
      | Some(0) => {
        if token.0.is_empty() {
          return Err(Error::Invalid);
        }
        self.add_composite_observer(token, list.clone(), accept, now)?;
        MessageOptions::set(response,
                            toad_msg::no_repeat::OBSERVE,
                            OptValue(msg::encode_uint_option(0).into_iter().collect()))
                      .map_err(|_| Error::NoMem(Pool::Payload))?;
      },
      | Some(1) => {
        if self.remove_observer_by_token(token).is_err() {
          log::error!("remove composite observe: unknown token");
          return Err(Error::NotFound);
        }
      },
      | Some(_) => return Err(Error::Invalid),
      | None => {},
    }

    // whether subscribing, cancelling or plain FETCHing, the response
    // carries the current values
    let mut writer = codec::select_writer(accept)?;
    let mut out = OutBuf::new(self.config.transfer.max_payload);
    composite_read_to_payload(&mut self.registry, &list, writer.as_mut(), &mut out)?;

    response.set_content_format(accept)
            .map_err(|_| Error::NoMem(Pool::Payload))?;
    response.payload = toad_msg::Payload(out.into_vec());
    Ok(())
  }

  fn op_discover(&mut self, response: &mut Packet, path: &Path) -> Result<(), Error> {
    let bootstrap = self.ctx.bootstrap_mode;

    // Object ID is required in device-management discovery, and Security
    // is never shown
    if !bootstrap && (path.level == Level::Root || path.obj == security::OBJECT_ID) {
      return Err(Error::NotAllowed);
    }

    // bootstrap discovery allows at most an Object ID
    if bootstrap && path.level > Level::Object {
      return Err(Error::NotAllowed);
    }

    let mut writer = if bootstrap {
      LinkFormatWriter::new(LinkMode::BootstrapDiscover { version: self.config.version })
    } else {
      LinkFormatWriter::new(LinkMode::Discover)
    };

    let mut out = OutBuf::new(self.config.transfer.max_payload);
    writer.put_begin(&mut out, path)?;

    let mut reported = false;
    let objs: Vec<u16> = self.registry.objects().iter().map(|o| o.id()).collect();

    for obj in objs {
      if path.level > Level::Root && path.obj != obj {
        continue;
      }

      let instances = self.registry.instance_ids(obj);
      let (version, reports_version) = self.registry
                                           .object(obj)
                                           .map(|o| (o.version(), o.reports_version()))
                                           .unwrap_or(((1, 0), false));

      if (bootstrap && (instances.is_empty() || reports_version))
         || (!bootstrap && path.level == Level::Object)
      {
        writer.put_corelink(&mut out, &Path::object(obj))?;
        if reports_version {
          writer.put_version(&mut out, version)?;
        }
        if !bootstrap {
          self.put_anchor_attrs(&mut writer, &mut out, &Path::object(obj))?;
        }
        reported = true;

        if instances.is_empty() {
          continue;
        }
      }

      for inst in instances {
        if path.level > Level::Object && path.obj_inst != inst {
          continue;
        }

        if path.level <= Level::ObjectInstance {
          writer.put_corelink(&mut out, &Path::instance(obj, inst))?;
          if !bootstrap {
            self.put_anchor_attrs(&mut writer, &mut out, &Path::instance(obj, inst))?;
          }
          reported = true;
        }

        if bootstrap {
          continue;
        }

        for res in self.registry.resource_ids(obj, inst) {
          if path.level == Level::Resource && path.res != res {
            continue;
          }

          self.discover_resource(&mut writer, &mut out, &Path::resource(obj, inst, res))?;
          reported = true;
        }
      }
    }

    if !reported {
      return Err(Error::NotFound);
    }

    response.set_content_format(codec::APP_LINK_FORMAT)
            .map_err(|_| Error::NoMem(Pool::Payload))?;
    response.payload = toad_msg::Payload(out.into_vec());
    Ok(())
  }

  /// `</o/i/r>[;dim=k]` plus effective pmin/pmax (inherited) and its own
  /// thresholds.
  fn discover_resource(&mut self,
                       writer: &mut LinkFormatWriter,
                       out: &mut OutBuf,
                       rpath: &Path)
                       -> Result<(), Error> {
    writer.put_corelink(out, rpath)?;

    if let Some(field) = self.registry.field(rpath.obj, rpath.res) {
      if field.multi > 1 {
        let dim = self.registry.live_res_instance_ids(rpath).len();
        writer.put_attr(out, "dim", dim)?;
      }
    }

    if let Ok(attrs) = crate::observe::gather_attrs(&self.registry, rpath, self.ctx.srv_obj_inst) {
      if attrs.pmin > 0 {
        writer.put_attr(out, "pmin", attrs.pmin)?;
      }
      if attrs.pmax > 0 {
        writer.put_attr(out, "pmax", attrs.pmax)?;
      }
      if let Some(gt) = attrs.gt {
        writer.put_attr(out, "gt", gt)?;
      }
      if let Some(lt) = attrs.lt {
        writer.put_attr(out, "lt", lt)?;
      }
      if let Some(st) = attrs.st {
        writer.put_attr(out, "st", st)?;
      }
    }

    Ok(())
  }

  fn put_anchor_attrs(&mut self,
                      writer: &mut LinkFormatWriter,
                      out: &mut OutBuf,
                      anchor: &Path)
                      -> Result<(), Error> {
    let attrs: Vec<crate::registry::attr::Attr> = self.registry.attrs().of(anchor).collect();
    for a in attrs {
      match a {
        | crate::registry::attr::Attr::Pmin(v) => writer.put_attr(out, "pmin", v)?,
        | crate::registry::attr::Attr::Pmax(v) => writer.put_attr(out, "pmax", v)?,
        | crate::registry::attr::Attr::Gt(v) => writer.put_attr(out, "gt", v)?,
        | crate::registry::attr::Attr::Lt(v) => writer.put_attr(out, "lt", v)?,
        | crate::registry::attr::Attr::St(v) => writer.put_attr(out, "st", v)?,
      };
    }
    Ok(())
  }

  fn apply_record(&mut self, rpath: &Path, value: Value) -> Result<(), Error> {
    let bootstrap = self.ctx.bootstrap_mode;

    // bootstrap writes provision instances as they go
    if bootstrap && self.registry.instance(rpath.obj, rpath.obj_inst).is_none() {
      self.registry.create_instance(rpath.obj, rpath.obj_inst)?;
    }

    let field = self.registry
                    .field(rpath.obj, rpath.res)
                    .ok_or(Error::NotFound)?;
    if !bootstrap && !field.perm.allows(Perm::W) {
      return Err(Error::NotAllowed);
    }

    self.registry.ensure_resource_instance(rpath)?;
    self.registry.set(rpath, value).map(|_| ())
  }

  fn apply_records(&mut self,
                   format: ContentFormat,
                   records: Vec<(Path, Option<RecordValue>)>)
                   -> Result<(), Error> {
    for (rpath, value) in records {
      if rpath.level < Level::Resource {
        continue;
      }

      let kind = self.registry
                     .field(rpath.obj, rpath.res)
                     .map(|f| f.kind)
                     .ok_or(Error::NotFound)?;

      let value = match value {
        | Some(RecordValue::Opaque(raw))
          if format == codec::OMA_TLV || format == codec::OMA_OLD_TLV =>
        {
          codec::oma_tlv::decode_value(kind, &raw)?
        },
        | Some(v) => v.into_value(kind)?,
        | None => return Err(Error::BadRequest),
      };

      self.apply_record(&rpath, value)?;
    }
    Ok(())
  }

  fn op_write(&mut self,
              path: &Path,
              format: Option<ContentFormat>,
              payload: &[u8],
              block_idx: Option<usize>,
              last_block: bool)
              -> Result<(), Error> {
    let format = format.unwrap_or(codec::PLAIN_TEXT);

    if codec::is_hierarchical(format) {
      if path.level < Level::ObjectInstance {
        return Err(Error::BadRequest);
      }
      if !self.ctx.bootstrap_mode {
        self.registry
            .instance(path.obj, path.obj_inst)
            .ok_or(Error::NotFound)?;
      }

      let records = parse_records(format, payload, path)?;
      return self.apply_records(format, records);
    }

    // single-value formats write exactly one resource (instance)
    if path.level < Level::Resource {
      return Err(Error::BadRequest);
    }

    if self.ctx.bootstrap_mode && self.registry.instance(path.obj, path.obj_inst).is_none() {
      self.registry.create_instance(path.obj, path.obj_inst)?;
    }

    let field = self.registry
                    .field(path.obj, path.res)
                    .ok_or(Error::NotFound)?
                    .clone();
    if !self.ctx.bootstrap_mode && !field.perm.allows(Perm::W) {
      return Err(Error::NotAllowed);
    }

    self.registry.ensure_resource_instance(path)?;

    let mut reader = codec::select_reader(format)?;
    let mut input = In::new(payload);

    if field.kind == ResourceKind::Opaque {
      return self.write_opaque_streamed(path, reader.as_mut(), &mut input, block_idx, last_block);
    }

    let value = match field.kind {
      | ResourceKind::String => {
        let mut buf = vec![0u8; field.capacity.max(1)];
        let n = reader.get_string(&mut input, &mut buf)?;
        Value::String(core::str::from_utf8(&buf[..n]).map_err(|_| Error::BadRequest)?
                                                     .to_owned())
      },
      | ResourceKind::Time => Value::Time(reader.get_time(&mut input)?),
      | ResourceKind::Float => Value::Float(reader.get_float(&mut input)?),
      | ResourceKind::Bool => Value::Bool(reader.get_bool(&mut input)?),
      | ResourceKind::ObjLnk => Value::ObjLnk(reader.get_objlnk(&mut input)?),
      | ResourceKind::S8 | ResourceKind::S16 | ResourceKind::S32 | ResourceKind::U8
      | ResourceKind::U16 => Value::S32(reader.get_s32(&mut input)?),
      | _ => Value::S64(reader.get_s64(&mut input)?),
    };

    self.registry
        .set(path, value.coerce(field.kind).map_err(|_| Error::BadRequest)?)
        .map(|_| ())
  }

  /// Stream an Opaque write chunk by chunk, resuming across blockwise
  /// transfers through the block context's opaque state.
  fn write_opaque_streamed(&mut self,
                           path: &Path,
                           reader: &mut dyn Reader,
                           input: &mut In<'_>,
                           block_idx: Option<usize>,
                           last_block: bool)
                           -> Result<(), Error> {
    let (mut opaque, mut offset) = match block_idx {
      | Some(i) => (self.block1[i].opaque, self.block1[i].current),
      | None => (OpaqueCtx::default(), 0),
    };

    if let (Some(i), 0) = (block_idx, offset) {
      // first block: Size1, when present, announces the full value
      opaque.len = self.block1[i].total_size;
      opaque.remaining = opaque.len;
    }

    let mut chunk = vec![0u8; 1024];
    loop {
      let mut last_chunk = false;
      let n = reader.get_opaque(input, &mut chunk, &mut opaque, &mut last_chunk)?;
      if n == 0 && !last_chunk {
        break;
      }

      self.registry
          .write_opaque_chunk(path, &chunk[..n], offset, last_chunk && last_block)?;
      offset += n;

      if last_chunk {
        break;
      }
    }

    if let Some(i) = block_idx {
      self.block1[i].opaque = opaque;
      self.block1[i].current = offset;
    }

    Ok(())
  }

  fn op_composite_write(&mut self, format: ContentFormat, payload: &[u8]) -> Result<(), Error> {
    if format != codec::APP_SENML_JSON && format != codec::APP_SENML_CBOR {
      return Err(Error::UnsupportedFormat);
    }

    // mixed success returns the first failing subrecord's code
    let records = parse_records(format, payload, &Path::root())?;
    self.apply_records(format, records)
  }

  fn op_write_attr(&mut self, path: &Path, request: &Packet) -> Result<(), Error> {
    // attributes never land on the Security object
    if path.obj == security::OBJECT_ID {
      return Err(Error::NotFound);
    }

    self.resolve_anchor(path)?;

    let queries: Vec<&str> = request.query().map_err(|_| Error::BadRequest)?;
    if queries.is_empty() {
      log::error!("no attribute found!");
      return Err(Error::BadRequest);
    }

    use crate::registry::attr::Attr;

    let mut pmin = self.registry.attrs().get(path, AttrKind::Pmin).map(|a| match a {
                                                                        | Attr::Pmin(v) => v,
                                                                        | _ => 0,
                                                                      });
    let mut pmax = self.registry.attrs().get(path, AttrKind::Pmax).map(|a| match a {
                                                                        | Attr::Pmax(v) => v,
                                                                        | _ => 0,
                                                                      });
    let float_of = |a: Attr| match a {
      | Attr::Gt(v) | Attr::Lt(v) | Attr::St(v) => v,
      | _ => 0.0,
    };
    let mut gt = self.registry.attrs().get(path, AttrKind::Gt).map(float_of);
    let mut lt = self.registry.attrs().get(path, AttrKind::Lt).map(float_of);
    let mut st = self.registry.attrs().get(path, AttrKind::St).map(float_of);

    for q in queries {
      let (name, value) = match q.split_once('=') {
        | Some((n, v)) => (n, Some(v)),
        | None => (q, None),
      };

      let kind = match name {
        | "pmin" => AttrKind::Pmin,
        | "pmax" => AttrKind::Pmax,
        | "gt" => AttrKind::Gt,
        | "lt" => AttrKind::Lt,
        | "st" => AttrKind::St,
        // unrecognized attributes are skipped
        | _ => continue,
      };

      match value {
        | None => match kind {
          | AttrKind::Pmin => pmin = None,
          | AttrKind::Pmax => pmax = None,
          | AttrKind::Gt => gt = None,
          | AttrKind::Lt => lt = None,
          | AttrKind::St => st = None,
        },
        | Some(v) => {
          if kind.needs_resource_level() && path.level <= Level::ObjectInstance {
            return Err(Error::BadRequest);
          }

          match kind {
            | AttrKind::Pmin | AttrKind::Pmax => {
              let parsed: i32 = v.parse().map_err(|_| Error::BadRequest)?;
              if parsed < 0 {
                return Err(Error::BadRequest);
              }
              if kind == AttrKind::Pmin {
                pmin = Some(parsed);
              } else {
                pmax = Some(parsed);
              }
            },
            | _ => {
              let parsed: f64 = v.parse().map_err(|_| Error::BadRequest)?;
              match kind {
                | AttrKind::Gt => gt = Some(parsed),
                | AttrKind::Lt => lt = Some(parsed),
                | _ => st = Some(parsed),
              }
            },
          }
        },
      }
    }

    if let (Some(pmin), Some(pmax)) = (pmin, pmax) {
      if pmin > pmax {
        log::debug!("pmin ({}) > pmax ({})", pmin, pmax);
        return Err(Error::BadRequest);
      }
    }

    if let (Some(lt), Some(gt)) = (lt, gt) {
      if lt >= gt {
        log::debug!("lt >= gt");
        return Err(Error::BadRequest);
      }

      if let Some(st) = st {
        if lt + 2.0 * st > gt {
          log::debug!("lt + 2*st > gt");
          return Err(Error::BadRequest);
        }
      }
    }

    let before_pmin = self.registry.attrs().get(path, AttrKind::Pmin);
    let before_pmax = self.registry.attrs().get(path, AttrKind::Pmax);

    let pool = self.registry.attrs_mut();
    match pmin {
      | Some(v) => pool.set(*path, Attr::Pmin(v))?,
      | None => {
        pool.unset(path, AttrKind::Pmin);
      },
    }
    match pmax {
      | Some(v) => pool.set(*path, Attr::Pmax(v))?,
      | None => {
        pool.unset(path, AttrKind::Pmax);
      },
    }
    match gt {
      | Some(v) => pool.set(*path, Attr::Gt(v))?,
      | None => {
        pool.unset(path, AttrKind::Gt);
      },
    }
    match lt {
      | Some(v) => pool.set(*path, Attr::Lt(v))?,
      | None => {
        pool.unset(path, AttrKind::Lt);
      },
    }
    match st {
      | Some(v) => pool.set(*path, Attr::St(v))?,
      | None => {
        pool.unset(path, AttrKind::St);
      },
    }

    let periods_changed = before_pmin != self.registry.attrs().get(path, AttrKind::Pmin)
                          || before_pmax != self.registry.attrs().get(path, AttrKind::Pmax);
    if periods_changed {
      self.observers_timestamp_update(path);
    }

    Ok(())
  }

  /// The target of a write-attributes request must exist at its level.
  fn resolve_anchor(&self, path: &Path) -> Result<(), Error> {
    match path.level {
      | Level::Root => Err(Error::BadRequest),
      | Level::Object => self.registry.object(path.obj).map(|_| ()).ok_or(Error::NotFound),
      | Level::ObjectInstance => self.registry
                                     .instance(path.obj, path.obj_inst)
                                     .map(|_| ())
                                     .ok_or(Error::NotFound),
      | Level::Resource => {
        self.registry
            .instance(path.obj, path.obj_inst)
            .and_then(|i| i.resources().iter().find(|r| r.res_id() == path.res))
            .map(|_| ())
            .ok_or(Error::NotFound)
      },
      | Level::ResourceInstance => self.registry
                                       .resource_instance(path)
                                       .map(|_| ())
                                       .ok_or(Error::NotFound),
    }
  }

  fn op_execute(&mut self, path: &Path, args: &[u8], now: u64) -> Result<(), Error> {
    let epath = Path::resource(path.obj, path.obj_inst, path.res);

    // the Server object's executables act on the engine itself
    if epath.obj == server::OBJECT_ID {
      self.registry
          .instance(epath.obj, epath.obj_inst)
          .ok_or(Error::NotFound)?;

      if epath.res == server::REG_UPDATE_TRIGGER {
        self.trigger_update_at(now, false);
        return Ok(());
      }

      if epath.res == server::DISABLE {
        let window = server::disable_timeout(&self.registry, epath.obj_inst) as u64 * 1_000;
        self.disable_server(epath.obj_inst, Some(now + window));
        self.rd_server_disabled(epath.obj_inst);
        return Ok(());
      }

      if epath.res == server::BOOTSTRAP_UPDATE_TRIGGER {
        return self.trigger_bootstrap();
      }
    }

    self.registry.execute(&epath, args)
  }

  fn op_create(&mut self,
               path: &Path,
               format: Option<ContentFormat>,
               payload: &[u8])
               -> Result<(), Error> {
    let format = format.unwrap_or_else(|| codec::default_accept(self.config.version));

    if payload.is_empty() {
      let inst = self.registry.next_free_instance_id(path.obj);
      return self.registry.create_instance(path.obj, inst);
    }

    // the payload may carry the instance id (TLV instance wrapper, SenML
    // full paths); otherwise the records are bare and we assign one
    let records = parse_records(format, payload, path).or_else(|_| {
                    let inst = self.registry.next_free_instance_id(path.obj);
                    parse_records(format, payload, &Path::instance(path.obj, inst))
                  })?;

    let inst = records.iter()
                      .find(|(p, _)| p.level >= Level::ObjectInstance)
                      .map(|(p, _)| p.obj_inst)
                      .unwrap_or_else(|| self.registry.next_free_instance_id(path.obj));

    self.registry.create_instance(path.obj, inst)?;

    if let Err(e) = self.apply_records(format, records) {
      let _ = self.registry.delete_instance(path.obj, inst);
      return Err(e);
    }

    Ok(())
  }

  fn op_delete(&mut self, path: &Path, now: u64) -> Result<(), Error> {
    if self.ctx.bootstrap_mode && path.level <= Level::Object {
      return self.bootstrap_delete(path);
    }

    if path.level != Level::ObjectInstance {
      return Err(Error::NotAllowed);
    }

    // the management interface may not delete Security or Device instances
    if path.obj == security::OBJECT_ID || path.obj == crate::obj::device::OBJECT_ID {
      return Err(Error::NotAllowed);
    }

    self.registry.delete_instance(path.obj, path.obj_inst)?;
    self.remove_observers_by_id(path.obj, Some(path.obj_inst));
    self.trigger_update_at(now, true);
    Ok(())
  }

  /// Bootstrap DELETE on `/` or `/obj`: wipe instances, keeping only the
  /// bootstrap server's own Security instance.
  fn bootstrap_delete(&mut self, path: &Path) -> Result<(), Error> {
    let objs: Vec<u16> = match path.level {
      | Level::Object => vec![path.obj],
      | _ => self.registry.objects().iter().map(|o| o.id()).collect(),
    };

    for obj in objs {
      for inst in self.registry.instance_ids(obj) {
        if obj == security::OBJECT_ID && security::is_bootstrap(&self.registry, inst) {
          continue;
        }

        self.registry.delete_instance(obj, inst)?;
        self.remove_observers_by_id(obj, Some(inst));
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use toad_msg::Id;

  use super::*;
  use crate::config::Config;
  use crate::registry::{Field, Object};
  use crate::test::{test_engine, Platform};
  use crate::value::ObjLnk;

  fn tok(n: u8) -> Token {
    Token(tinyvec::array_vec!([u8; 8] => n))
  }

  fn engine() -> crate::engine::Engine<Platform> {
    let (mut engine, _) = test_engine(Config::default());
    engine.registry_mut()
          .register_object(Object::new(3303,
                                       (1, 1),
                                       vec![Field::new(5700, ResourceKind::Float, Perm::R),
                                            Field::new(5701, ResourceKind::String, Perm::RW)
                                              .capacity(16),
                                            Field::new(5605, ResourceKind::Opaque, Perm::RW)
                                              .capacity(1024)],
                                       3))
          .unwrap();
    engine.registry_mut().create_instance(3303, 0).unwrap();
    engine.registry_mut()
          .set_float(&Path::resource(3303, 0, 5700), 21.5)
          .unwrap();
    engine.registry_mut().take_dirty();
    engine
  }

  fn get(path: &str, accept: ContentFormat) -> Packet {
    let mut p = Packet::new(Type::Con, code::GET, Id(7), tok(1));
    p.set_path(path.trim_start_matches('/')).unwrap();
    p.set_accept(accept).unwrap();
    p
  }

  fn response_of(engine: &mut crate::engine::Engine<Platform>, request: Packet) -> Packet {
    engine.handle_request(request, 0).unwrap().packet
  }

  #[test]
  fn read_single_resource_plain_text() {
    let mut e = engine();
    let rsp = response_of(&mut e, get("/3303/0/5700", codec::PLAIN_TEXT));
    assert_eq!(rsp.code, code::CONTENT);
    assert_eq!(rsp.ty, Type::Ack);
    assert_eq!(core::str::from_utf8(&rsp.payload.0).unwrap(), "21.5");
  }

  #[test]
  fn read_unknown_object_is_4_04() {
    let mut e = engine();
    let rsp = response_of(&mut e, get("/7777/0", codec::PLAIN_TEXT));
    assert_eq!(rsp.code, code::NOT_FOUND);
  }

  #[test]
  fn write_updates_storage_and_echoes_2_04() {
    let mut e = engine();
    let mut req = Packet::new(Type::Con, code::PUT, Id(8), tok(2));
    req.set_path("3303/0/5701").unwrap();
    req.set_content_format(codec::PLAIN_TEXT).unwrap();
    req.payload = toad_msg::Payload(b"cellar".to_vec());

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CHANGED);
    assert_eq!(e.registry().get_string(&Path::resource(3303, 0, 5701)).unwrap(),
               "cellar");
  }

  #[test]
  fn write_to_read_only_resource_is_4_05() {
    let mut e = engine();
    let mut req = Packet::new(Type::Con, code::PUT, Id(9), tok(2));
    req.set_path("3303/0/5700").unwrap();
    req.set_content_format(codec::PLAIN_TEXT).unwrap();
    req.payload = toad_msg::Payload(b"1.5".to_vec());

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn put_without_content_format_is_write_attributes() {
    let mut e = engine();
    let mut req = Packet::new(Type::Con, code::PUT, Id(10), tok(2));
    req.set_path("3303/0/5700").unwrap();
    req.add_query("pmin=5").unwrap();
    req.add_query("pmax=60").unwrap();

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CHANGED);
    assert_eq!(e.registry().attrs().get(&Path::resource(3303, 0, 5700), AttrKind::Pmin),
               Some(crate::registry::attr::Attr::Pmin(5)));
  }

  #[test]
  fn bad_attribute_combinations_are_4_00() {
    let mut e = engine();

    let mut req = Packet::new(Type::Con, code::PUT, Id(11), tok(2));
    req.set_path("3303/0/5700").unwrap();
    req.add_query("pmin=60").unwrap();
    req.add_query("pmax=5").unwrap();
    assert_eq!(response_of(&mut e, req).code, code::BAD_REQUEST);

    // thresholds may not anchor above resource level
    let mut req = Packet::new(Type::Con, code::PUT, Id(12), tok(2));
    req.set_path("3303/0").unwrap();
    req.add_query("gt=5").unwrap();
    assert_eq!(response_of(&mut e, req).code, code::BAD_REQUEST);

    // lt + 2*st must stay below gt
    let mut req = Packet::new(Type::Con, code::PUT, Id(13), tok(2));
    req.set_path("3303/0/5700").unwrap();
    req.add_query("lt=10").unwrap();
    req.add_query("gt=20").unwrap();
    req.add_query("st=6").unwrap();
    assert_eq!(response_of(&mut e, req).code, code::BAD_REQUEST);
  }

  #[test]
  fn observe_installs_an_observer_and_echoes_the_option() {
    let mut e = engine();
    let mut req = get("/3303/0/5700", codec::PLAIN_TEXT);
    MessageOptions::set(&mut req,
                        toad_msg::no_repeat::OBSERVE,
                        OptValue(vec![].into_iter().collect())).unwrap();

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CONTENT);
    assert!(MessageOptions::get(&rsp, toad_msg::no_repeat::OBSERVE).is_some());
    assert_eq!(e.ctx.observers.len(), 1);

    // cancel with Observe:1
    let mut req = get("/3303/0/5700", codec::PLAIN_TEXT);
    MessageOptions::set(&mut req,
                        toad_msg::no_repeat::OBSERVE,
                        OptValue(vec![1].into_iter().collect())).unwrap();
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CONTENT);
    assert!(e.ctx.observers.is_empty());
  }

  #[test]
  fn execute_without_a_handler_is_4_04() {
    let mut e = engine();
    let mut req = Packet::new(Type::Con, code::POST, Id(14), tok(3));
    req.set_path("3/0/4").unwrap();
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::NOT_FOUND);
  }

  #[test]
  fn delete_of_device_is_4_05() {
    let mut e = engine();
    let mut req = Packet::new(Type::Con, code::DELETE, Id(15), tok(3));
    req.set_path("3/0").unwrap();
    assert_eq!(response_of(&mut e, req).code, code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn create_then_delete_instance() {
    let mut e = engine();

    let mut req = Packet::new(Type::Con, code::POST, Id(16), tok(3));
    req.set_path("3303").unwrap();
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CREATED);
    assert_eq!(e.registry().instance_ids(3303), vec![0, 1]);

    let mut req = Packet::new(Type::Con, code::DELETE, Id(17), tok(3));
    req.set_path("3303/1").unwrap();
    assert_eq!(response_of(&mut e, req).code, code::DELETED);
    assert_eq!(e.registry().instance_ids(3303), vec![0]);
  }

  #[test]
  fn tlv_instance_write_applies_all_records() {
    let mut e = engine();

    let mut w = codec::oma_tlv::TlvWriter::default();
    let mut out = OutBuf::new(128);
    w.put_begin(&mut out, &Path::instance(3303, 0)).unwrap();
    w.put_string(&mut out, &Path::resource(3303, 0, 5701), "attic").unwrap();

    let mut req = Packet::new(Type::Con, code::PUT, Id(18), tok(4));
    req.set_path("3303/0").unwrap();
    req.set_content_format(codec::OMA_TLV).unwrap();
    req.payload = toad_msg::Payload(out.into_vec());

    assert_eq!(response_of(&mut e, req).code, code::CHANGED);
    assert_eq!(e.registry().get_string(&Path::resource(3303, 0, 5701)).unwrap(),
               "attic");
  }

  #[test]
  fn discover_emits_links_and_attributes() {
    let mut e = engine();
    e.registry_mut()
     .attrs_mut()
     .set(Path::resource(3303, 0, 5700), crate::registry::attr::Attr::Pmin(5))
     .unwrap();

    let rsp = response_of(&mut e, get("/3303", codec::APP_LINK_FORMAT));
    assert_eq!(rsp.code, code::CONTENT);
    let body = core::str::from_utf8(&rsp.payload.0).unwrap();
    assert!(body.starts_with("</3303>;ver=1.1"), "got {}", body);
    assert!(body.contains("</3303/0>"));
    assert!(body.contains("</3303/0/5700>;pmin=5"));
  }

  #[test]
  fn discover_of_security_is_refused() {
    let mut e = engine();
    assert_eq!(response_of(&mut e, get("/0", codec::APP_LINK_FORMAT)).code,
               code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn fetch_composite_read() {
    let mut e = engine();

    let mut req = Packet::new(Type::Con, code::FETCH, Id(19), tok(5));
    req.set_content_format(codec::APP_SENML_JSON).unwrap();
    req.set_accept(codec::APP_SENML_JSON).unwrap();
    req.payload =
      toad_msg::Payload(br#"[{"n":"/3303/0/5700"},{"n":"/3/0/0"}]"#.to_vec());

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CONTENT);
    let parsed = codec::senml_json::parse(&rsp.payload.0).unwrap();
    assert!(parsed.iter().any(|(p, _)| *p == Path::resource(3303, 0, 5700)));
    assert!(parsed.iter().any(|(p, _)| *p == Path::resource(3, 0, 0)));
  }

  #[test]
  fn ipatch_composite_write_mixed_success_maps_first_failure() {
    let mut e = engine();

    let mut req = Packet::new(Type::Con, code::IPATCH, Id(20), tok(6));
    req.set_content_format(codec::APP_SENML_JSON).unwrap();
    // second record hits a read-only (no W perm) resource -> 4.05
    req.payload = toad_msg::Payload(
      br#"[{"n":"/3303/0/5701","vs":"ok"},{"n":"/3303/0/5700","v":5}]"#.to_vec());

    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn block1_write_reassembles_and_rejects_reordering() {
    let mut e = engine();

    let body: Vec<u8> = (0..900u32).map(|i| i as u8).collect();
    let opaque_path = "19/0/0";
    e.registry_mut()
     .register_object(Object::new(19,
                                  (1, 0),
                                  vec![Field::new(0, ResourceKind::Opaque, Perm::RW).capacity(2048)
                                                                                    .multi(4)],
                                  2))
     .unwrap();
    e.registry_mut().create_instance(19, 0).unwrap();
    e.registry_mut()
     .create_resource_instance(&Path::resource_instance(19, 0, 0, 0))
     .unwrap();

    // block 0 of 512
    let mut req = Packet::new(Type::Con, code::PUT, Id(21), tok(7));
    req.set_path(opaque_path).unwrap();
    req.set_content_format(codec::APP_OCTET_STREAM).unwrap();
    req.set_block1(512, 0, true).unwrap();
    req.set_size1(body.len() as u64).unwrap();
    req.payload = toad_msg::Payload(body[..512].to_vec());
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CONTINUE);

    // block 1, final
    let mut req = Packet::new(Type::Con, code::PUT, Id(22), tok(7));
    req.set_path(opaque_path).unwrap();
    req.set_content_format(codec::APP_OCTET_STREAM).unwrap();
    req.set_block1(512, 1, false).unwrap();
    req.payload = toad_msg::Payload(body[512..].to_vec());
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CHANGED);

    assert_eq!(e.registry()
                .get_opaque(&Path::resource(19, 0, 0))
                .unwrap(),
               body);

    // a transfer that skips ahead yields 4.08 and discards the context
    let mut req = Packet::new(Type::Con, code::PUT, Id(23), tok(8));
    req.set_path(opaque_path).unwrap();
    req.set_content_format(codec::APP_OCTET_STREAM).unwrap();
    req.set_block1(512, 0, true).unwrap();
    req.payload = toad_msg::Payload(body[..512].to_vec());
    assert_eq!(response_of(&mut e, req).code, code::CONTINUE);

    let mut req = Packet::new(Type::Con, code::PUT, Id(24), tok(8));
    req.set_path(opaque_path).unwrap();
    req.set_content_format(codec::APP_OCTET_STREAM).unwrap();
    req.set_block1(512, 3, false).unwrap();
    req.payload = toad_msg::Payload(body[512..].to_vec());
    assert_eq!(response_of(&mut e, req).code, code::REQUEST_ENTITY_INCOMPLETE);
  }

  #[test]
  fn bootstrap_finish_transitions_the_machine() {
    let mut e = engine();
    e.ctx.bootstrap_mode = true;

    let mut req = Packet::new(Type::Con, code::POST, Id(25), tok(9));
    req.set_path("bs").unwrap();
    let rsp = response_of(&mut e, req);
    assert_eq!(rsp.code, code::CHANGED);
  }


  #[test]
  fn bootstrap_writes_provision_new_security_instances() {
    let mut e = engine();
    e.ctx.bootstrap_mode = true;

    let mut w = codec::oma_tlv::TlvWriter::default();
    let mut out = OutBuf::new(128);
    w.put_begin(&mut out, &Path::instance(0, 1)).unwrap();
    w.put_string(&mut out, &Path::resource(0, 1, 0), "coap://192.0.2.9")
     .unwrap();
    w.put_s16(&mut out, &Path::resource(0, 1, 10), 102).unwrap();

    let mut req = Packet::new(Type::Con, code::PUT, Id(30), tok(11));
    req.set_path("0/1").unwrap();
    req.set_content_format(codec::OMA_TLV).unwrap();
    req.payload = toad_msg::Payload(out.into_vec());

    assert_eq!(response_of(&mut e, req).code, code::CHANGED);
    assert_eq!(e.registry().get_string(&Path::resource(0, 1, 0)).unwrap(),
               "coap://192.0.2.9");
    assert_eq!(e.registry().get_u16(&Path::resource(0, 1, 10)).unwrap(), 102);

    // the management interface gets no such access to Security
    e.ctx.bootstrap_mode = false;
    let mut req = Packet::new(Type::Con, code::PUT, Id(31), tok(12));
    req.set_path("0/1/2").unwrap();
    req.set_content_format(codec::PLAIN_TEXT).unwrap();
    req.payload = toad_msg::Payload(b"3".to_vec());
    assert_eq!(response_of(&mut e, req).code, code::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn objlnk_survives_a_senml_write() {
    let mut e = engine();
    e.registry_mut()
     .register_object(Object::new(9000,
                                  (1, 0),
                                  vec![Field::new(0, ResourceKind::ObjLnk, Perm::RW)],
                                  1))
     .unwrap();
    e.registry_mut().create_instance(9000, 0).unwrap();

    let mut req = Packet::new(Type::Con, code::IPATCH, Id(26), tok(10));
    req.set_content_format(codec::APP_SENML_JSON).unwrap();
    req.payload = toad_msg::Payload(br#"[{"n":"/9000/0/0","vlo":"3303:0"}]"#.to_vec());
    assert_eq!(response_of(&mut e, req).code, code::CHANGED);

    assert_eq!(e.registry().get_objlnk(&Path::resource(9000, 0, 0)).unwrap(),
               ObjLnk { obj: 3303, inst: 0 });
  }
}
