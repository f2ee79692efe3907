use core::fmt;

use crate::config::Config;
use crate::error::{Error, Pool};
use crate::path::{Level, Path};
use crate::value::{ResourceKind, Value};

pub mod attr;

/// Access rights of a resource, a bitmask of R / W / X.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Perm(u8);

impl Perm {
  /// no access
  pub const NONE: Perm = Perm(0);
  /// readable
  pub const R: Perm = Perm(1);
  /// writable
  pub const W: Perm = Perm(2);
  /// readable + writable
  pub const RW: Perm = Perm(3);
  /// executable
  pub const X: Perm = Perm(4);

  /// Does this mask include all of `other`?
  pub fn allows(&self, other: Perm) -> bool {
    self.0 & other.0 == other.0
  }
}

impl core::ops::BitOr for Perm {
  type Output = Perm;

  fn bitor(self, rhs: Perm) -> Perm {
    Perm(self.0 | rhs.0)
  }
}

/// Static description of one resource of an object.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
  /// resource id
  pub res_id: u16,
  /// wire/storage type
  pub kind: ResourceKind,
  /// access rights
  pub perm: Perm,
  /// a missing optional resource is not an error during reads
  pub optional: bool,
  /// number of resource-instance slots; 1 = single-instance
  pub multi: u16,
  /// storage bytes per slot (only meaningful for String / Opaque)
  pub capacity: usize,
  /// value new instances start with; fixed-width cells default to zero
  pub default: Option<Value>,
}

impl Field {
  /// A single-instance, mandatory field. Strings and opaques get a 64 byte
  /// cell unless [`Field::capacity`] says otherwise.
  pub fn new(res_id: u16, kind: ResourceKind, perm: Perm) -> Self {
    Field { res_id,
            kind,
            perm,
            optional: false,
            multi: 1,
            capacity: kind.fixed_len().unwrap_or(64),
            default: None }
  }

  /// Start new instances with `value` instead of zeroes.
  pub fn default_value(mut self, value: Value) -> Self {
    self.default = Some(value);
    self
  }

  /// Mark the field optional.
  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  /// Give the field `slots` resource-instance slots.
  pub fn multi(mut self, slots: u16) -> Self {
    self.multi = slots;
    self
  }

  /// Storage bytes per slot.
  pub fn capacity(mut self, bytes: usize) -> Self {
    self.capacity = bytes;
    self
  }

  fn slot_capacity(&self) -> usize {
    self.kind.fixed_len().unwrap_or(self.capacity)
  }
}

/// Something that happened to a resource, dispatched to the owning
/// object's [`ObjectHandler`].
#[derive(Debug)]
pub enum ResourceEvent<'a> {
  /// A reader is about to serialize the resource; the handler may supply
  /// a fresh value with [`Handled::Fresh`].
  Read {
    #[allow(missing_docs)]
    res_id: u16,
    #[allow(missing_docs)]
    res_inst_id: u16,
  },
  /// A write is about to land.
  PreWrite {
    #[allow(missing_docs)]
    res_id: u16,
    #[allow(missing_docs)]
    res_inst_id: u16,
  },
  /// Veto point: `data` is the pending storage image. Failing here turns
  /// the write into 4.00 Bad Request.
  Validate {
    #[allow(missing_docs)]
    res_id: u16,
    #[allow(missing_docs)]
    res_inst_id: u16,
    /// pending bytes
    data: &'a [u8],
    /// false while more blockwise chunks are outstanding
    last_block: bool,
  },
  /// `data` has landed in storage.
  PostWrite {
    #[allow(missing_docs)]
    res_id: u16,
    #[allow(missing_docs)]
    res_inst_id: u16,
    /// stored bytes
    data: &'a [u8],
    /// false while more blockwise chunks are outstanding
    last_block: bool,
  },
  /// Server invoked Execute; `args` is the raw argument string.
  Execute {
    #[allow(missing_docs)]
    res_id: u16,
    /// raw CoAP payload of the Execute request
    args: &'a [u8],
  },
}

/// What a handler did with a [`ResourceEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
  /// The handler does not care about this event.
  ///
  /// For [`ResourceEvent::Execute`] this means "no such executable" and
  /// becomes 4.04 Not Found.
  Ignored,
  /// The handler accepted the event.
  Accepted,
  /// The handler supplies a fresh value (only meaningful for
  /// [`ResourceEvent::Read`]).
  Fresh(Value),
}

/// Per-object application hooks.
///
/// One implementation per registered [`Object`]; the registry dispatches
/// lifecycle and resource events to it. Every method has a do-nothing
/// default.
pub trait ObjectHandler {
  /// An instance was created (by the application or by a server Create).
  /// Failing here undoes the create and propagates the error.
  fn instance_created(&mut self, inst_id: u16) -> Result<(), Error> {
    let _ = inst_id;
    Ok(())
  }

  /// An instance is going away. Errors are logged and ignored; the delete
  /// proceeds.
  fn instance_deleted(&mut self, inst_id: u16) -> Result<(), Error> {
    let _ = inst_id;
    Ok(())
  }

  /// A resource event. See [`ResourceEvent`] and [`Handled`].
  fn resource(&mut self, inst_id: u16, event: ResourceEvent<'_>) -> Result<Handled, Error> {
    let _ = (inst_id, event);
    Ok(Handled::Ignored)
  }

  /// Will serving this resource outlive the time window for a piggybacked ACK? Answering true
  /// makes the dispatcher acknowledge the request with an empty ACK up
  /// front and send the eventual response as a separate confirmable
  /// exchange.
  fn needs_separate_response(&mut self, inst_id: u16, res_id: u16) -> bool {
    let _ = (inst_id, res_id);
    false
  }
}

/// An [`ObjectHandler`] that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandler;

impl ObjectHandler for NopHandler {}

/// Static descriptor of an object type, registered once at startup.
pub struct Object {
  id: u16,
  version: (u8, u8),
  core: bool,
  fields: Vec<Field>,
  max_instances: u16,
  handler: Box<dyn ObjectHandler>,
}

impl fmt::Debug for Object {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Object")
     .field("id", &self.id)
     .field("version", &self.version)
     .field("core", &self.core)
     .field("fields", &self.fields)
     .field("max_instances", &self.max_instances)
     .finish()
  }
}

impl Object {
  /// Describe an object. `version` is `(major, minor)`.
  pub fn new(id: u16, version: (u8, u8), fields: Vec<Field>, max_instances: u16) -> Self {
    Object { id,
             version,
             core: false,
             fields,
             max_instances,
             handler: Box::new(NopHandler) }
  }

  /// Attach an [`ObjectHandler`].
  pub fn handler(mut self, handler: Box<dyn ObjectHandler>) -> Self {
    self.handler = handler;
    self
  }

  /// Mark as a core object (survives bootstrap delete).
  pub fn core(mut self) -> Self {
    self.core = true;
    self
  }

  #[allow(missing_docs)]
  pub fn id(&self) -> u16 {
    self.id
  }

  /// `(major, minor)`
  pub fn version(&self) -> (u8, u8) {
    self.version
  }

  #[allow(missing_docs)]
  pub fn is_core(&self) -> bool {
    self.core
  }

  #[allow(missing_docs)]
  pub fn fields(&self) -> &[Field] {
    &self.fields
  }

  /// The field describing `res_id`, if the object has one.
  pub fn field(&self, res_id: u16) -> Option<&Field> {
    self.fields.iter().find(|f| f.res_id == res_id)
  }

  /// Objects at version 1.0 don't report a version in registration and
  /// discover payloads.
  pub fn reports_version(&self) -> bool {
    self.version != (1, 0)
  }
}

/// One storage cell of a resource.
#[derive(Debug, Clone)]
pub struct ResInst {
  pub(crate) id: Option<u16>,
  pub(crate) buf: Box<[u8]>,
  pub(crate) len: usize,
  pub(crate) read_only: bool,
}

impl ResInst {
  fn free(capacity: usize) -> Self {
    ResInst { id: None,
              buf: vec![0u8; capacity].into_boxed_slice(),
              len: 0,
              read_only: false }
  }

  /// The stored bytes (for strings, without the terminating NUL).
  pub fn bytes(&self) -> &[u8] {
    &self.buf[..self.len]
  }

  /// This slot's resource-instance id, `None` while not created.
  pub fn id(&self) -> Option<u16> {
    self.id
  }

  /// Writes to a read-only slot yield 4.01 / `Unauthorized`.
  pub fn is_read_only(&self) -> bool {
    self.read_only
  }
}

/// A resource inside an instance: one slot for single-instance fields,
/// `multi` slots otherwise.
#[derive(Debug, Clone)]
pub struct Resource {
  pub(crate) res_id: u16,
  pub(crate) slots: Vec<ResInst>,
}

impl Resource {
  #[allow(missing_docs)]
  pub fn res_id(&self) -> u16 {
    self.res_id
  }

  /// Live slots, in slot order.
  pub fn live_slots(&self) -> impl Iterator<Item = &ResInst> {
    self.slots.iter().filter(|s| s.id.is_some())
  }

  pub(crate) fn slot(&self, res_inst_id: u16) -> Option<&ResInst> {
    self.slots.iter().find(|s| s.id == Some(res_inst_id))
  }

  pub(crate) fn slot_mut(&mut self, res_inst_id: u16) -> Option<&mut ResInst> {
    self.slots.iter_mut().find(|s| s.id == Some(res_inst_id))
  }
}

/// A live object instance and its resource storage.
#[derive(Debug, Clone)]
pub struct Instance {
  pub(crate) obj_id: u16,
  pub(crate) inst_id: u16,
  pub(crate) resources: Vec<Resource>,
}

impl Instance {
  #[allow(missing_docs)]
  pub fn obj_id(&self) -> u16 {
    self.obj_id
  }

  #[allow(missing_docs)]
  pub fn inst_id(&self) -> u16 {
    self.inst_id
  }

  /// Resources in field order.
  pub fn resources(&self) -> &[Resource] {
    &self.resources
  }

  pub(crate) fn resource(&self, res_id: u16) -> Option<&Resource> {
    self.resources.iter().find(|r| r.res_id == res_id)
  }

  pub(crate) fn resource_mut(&mut self, res_id: u16) -> Option<&mut Resource> {
    self.resources.iter_mut().find(|r| r.res_id == res_id)
  }
}

/// The object/instance/resource tables every other subsystem reads and
/// mutates.
///
/// One registry per [`Engine`](crate::Engine). Typed sets route through a
/// single checked path that honors read-only flags, handler hooks and
/// the storage invariants; changes to readable resources are queued for
/// the observation engine (see [`Registry::take_dirty`]).
pub struct Registry {
  objects: Vec<Object>,
  instances: Vec<Instance>,
  attrs: attr::Pool,
  dirty: Vec<Path>,
}

impl fmt::Debug for Registry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registry")
     .field("objects", &self.objects)
     .field("instances", &self.instances.len())
     .field("attrs", &self.attrs)
     .finish()
  }
}

impl Registry {
  /// An empty registry sized per `config`.
  pub fn new(config: &Config) -> Self {
    Registry { objects: vec![],
               instances: vec![],
               attrs: attr::Pool::new(config.tables.attributes),
               dirty: vec![] }
  }

  /// Append `obj` to the object table.
  pub fn register_object(&mut self, obj: Object) -> Result<(), Error> {
    if self.object(obj.id()).is_some() {
      return Err(Error::Invalid);
    }

    let at = self.objects
                 .binary_search_by_key(&obj.id(), |o| o.id())
                 .unwrap_or_else(|missing_at| missing_at);
    self.objects.insert(at, obj);
    Ok(())
  }

  /// Remove an object, its instances and their attributes.
  ///
  /// Observers anchored under the object are the engine's to evict; see
  /// [`Engine::unregister_object`](crate::Engine::unregister_object).
  pub fn unregister_object(&mut self, obj_id: u16) -> Result<(), Error> {
    if self.object(obj_id).is_none() {
      return Err(Error::NotFound);
    }

    self.objects.retain(|o| o.id() != obj_id);
    self.instances.retain(|i| i.obj_id != obj_id);
    self.attrs.clear_subtree(&Path::object(obj_id));
    Ok(())
  }

  /// The registered object with `obj_id`.
  pub fn object(&self, obj_id: u16) -> Option<&Object> {
    self.objects.iter().find(|o| o.id() == obj_id)
  }

  /// All registered objects, ascending by id.
  pub fn objects(&self) -> &[Object] {
    &self.objects
  }

  /// The live instance at `/obj_id/inst_id`.
  pub fn instance(&self, obj_id: u16, inst_id: u16) -> Option<&Instance> {
    self.instances
        .iter()
        .find(|i| i.obj_id == obj_id && i.inst_id == inst_id)
  }

  fn instance_mut(&mut self, obj_id: u16, inst_id: u16) -> Option<&mut Instance> {
    self.instances
        .iter_mut()
        .find(|i| i.obj_id == obj_id && i.inst_id == inst_id)
  }

  /// Ids of the live instances of `obj_id`, ascending.
  pub fn instance_ids(&self, obj_id: u16) -> Vec<u16> {
    self.instances
        .iter()
        .filter(|i| i.obj_id == obj_id)
        .map(|i| i.inst_id)
        .collect()
  }

  /// The field of `/obj_id/_/res_id`.
  pub fn field(&self, obj_id: u16, res_id: u16) -> Option<&Field> {
    self.object(obj_id).and_then(|o| o.field(res_id))
  }

  /// Resource ids present on `/obj_id/inst_id`, in field order.
  pub fn resource_ids(&self, obj_id: u16, inst_id: u16) -> Vec<u16> {
    self.instance(obj_id, inst_id)
        .map(|i| i.resources.iter().map(|r| r.res_id).collect())
        .unwrap_or_default()
  }

  /// Live resource-instance ids of the (resource-level) `path`.
  pub fn live_res_instance_ids(&self, path: &Path) -> Vec<u16> {
    self.instance(path.obj, path.obj_inst)
        .and_then(|i| i.resource(path.res))
        .map(|r| r.live_slots().filter_map(|s| s.id).collect())
        .unwrap_or_default()
  }

  /// The smallest instance id of `obj_id` not in use.
  pub fn next_free_instance_id(&self, obj_id: u16) -> u16 {
    let live = self.instance_ids(obj_id);
    (0..=u16::MAX).find(|id| !live.contains(id)).unwrap_or(0)
  }

  /// Ask the owning handler whether `path` should be served as a separate
  /// response (see [`ObjectHandler::needs_separate_response`]).
  pub(crate) fn wants_separate_response(&mut self, path: &Path) -> bool {
    if path.level < Level::Resource {
      return false;
    }

    match self.objects
              .iter_mut()
              .find(|o| o.id() == path.obj)
    {
      | Some(obj) => obj.handler.needs_separate_response(path.obj_inst, path.res),
      | None => false,
    }
  }

  /// Create `/obj_id/inst_id`, allocating storage for every field and
  /// running the object's create hook. The hook failing undoes the
  /// create.
  pub fn create_instance(&mut self, obj_id: u16, inst_id: u16) -> Result<(), Error> {
    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == obj_id)
                      .ok_or(Error::NotFound)?;

    let live = self.instances.iter().filter(|i| i.obj_id == obj_id).count();
    if live as u16 >= self.objects[obj_idx].max_instances {
      log::error!("no more instances available for obj {}", obj_id);
      return Err(Error::NoMem(Pool::Instance));
    }

    if self.instance(obj_id, inst_id).is_some() {
      return Err(Error::BadRequest);
    }

    let resources = self.objects[obj_idx].fields
                                         .iter()
                                         .map(|f| {
                                           let cap = f.slot_capacity();
                                           let mut slots: Vec<ResInst> =
                                             (0..f.multi).map(|_| ResInst::free(cap)).collect();
                                           if f.multi == 1 {
                                             slots[0].id = Some(0);
                                             slots[0].len = f.kind.fixed_len().unwrap_or(0);
                                             if let Some(v) = &f.default {
                                               let bytes = v.storage_bytes();
                                               let pad = usize::from(f.kind == ResourceKind::String);
                                               if bytes.len() + pad <= cap {
                                                 slots[0].buf[..bytes.len()].copy_from_slice(&bytes);
                                                 slots[0].len = bytes.len();
                                               }
                                             }
                                           }
                                           Resource { res_id: f.res_id,
                                                      slots }
                                         })
                                         .collect();

    let at = self.instances
                 .binary_search_by_key(&(obj_id, inst_id), |i| (i.obj_id, i.inst_id))
                 .unwrap_or_else(|missing_at| missing_at);
    self.instances.insert(at,
                          Instance { obj_id,
                                     inst_id,
                                     resources });

    if let Err(e) = self.objects[obj_idx].handler.instance_created(inst_id) {
      log::error!("create hook failed for {}/{}: {:?}", obj_id, inst_id, e);
      self.instances
          .retain(|i| !(i.obj_id == obj_id && i.inst_id == inst_id));
      return Err(e);
    }

    Ok(())
  }

  /// Delete `/obj_id/inst_id` and every attribute anchored on it or its
  /// resources. A failing delete hook is logged but does not stop the
  /// delete.
  pub fn delete_instance(&mut self, obj_id: u16, inst_id: u16) -> Result<(), Error> {
    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == obj_id)
                      .ok_or(Error::NotFound)?;

    if self.instance(obj_id, inst_id).is_none() {
      return Err(Error::NotFound);
    }

    if let Err(e) = self.objects[obj_idx].handler.instance_deleted(inst_id) {
      log::warn!("delete hook failed for {}/{}: {:?}", obj_id, inst_id, e);
    }

    self.instances
        .retain(|i| !(i.obj_id == obj_id && i.inst_id == inst_id));
    self.attrs
        .clear_subtree(&Path::instance(obj_id, inst_id));
    Ok(())
  }

  /// The write-attribute pool.
  pub fn attrs(&self) -> &attr::Pool {
    &self.attrs
  }

  /// The write-attribute pool, mutably.
  pub fn attrs_mut(&mut self) -> &mut attr::Pool {
    &mut self.attrs
  }

  /// Paths whose values changed (and are readable) since the last call.
  /// The engine drains this into the observation engine every tick.
  pub fn take_dirty(&mut self) -> Vec<Path> {
    core::mem::take(&mut self.dirty)
  }

  fn slot_id_for(path: &Path) -> u16 {
    match path.level {
      | Level::ResourceInstance => path.res_inst,
      | _ => 0,
    }
  }

  /// The storage cell `path` points at.
  pub fn resource_instance(&self, path: &Path) -> Option<&ResInst> {
    let ri = Self::slot_id_for(path);
    self.instance(path.obj, path.obj_inst)
        .and_then(|i| i.resource(path.res))
        .and_then(|r| r.slot(ri))
  }

  /// Create the resource-instance slot `path` names.
  pub fn create_resource_instance(&mut self, path: &Path) -> Result<(), Error> {
    if path.level != Level::ResourceInstance {
      return Err(Error::Invalid);
    }

    let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?.clone();
    let res = self.instance_mut(path.obj, path.obj_inst)
                  .ok_or(Error::NotFound)?
                  .resource_mut(path.res)
                  .ok_or(Error::NotFound)?;

    if res.slot(path.res_inst).is_some() {
      return Err(Error::BadRequest);
    }

    let free = res.slots
                  .iter_mut()
                  .find(|s| s.id.is_none())
                  .ok_or(Error::NoMem(Pool::Storage))?;
    free.id = Some(path.res_inst);
    free.len = field.kind.fixed_len().unwrap_or(0);
    Ok(())
  }

  /// Create the slot if a write names one that does not exist yet.
  pub(crate) fn ensure_resource_instance(&mut self, path: &Path) -> Result<(), Error> {
    if path.level != Level::ResourceInstance || self.resource_instance(path).is_some() {
      return Ok(());
    }

    self.create_resource_instance(path)
  }

  /// Free the slot `path` names.
  pub fn delete_resource_instance(&mut self, path: &Path) -> Result<(), Error> {
    if path.level != Level::ResourceInstance {
      return Err(Error::Invalid);
    }

    let res = self.instance_mut(path.obj, path.obj_inst)
                  .ok_or(Error::NotFound)?
                  .resource_mut(path.res)
                  .ok_or(Error::NotFound)?;
    let slot = res.slot_mut(path.res_inst).ok_or(Error::NotFound)?;
    slot.id = None;
    slot.len = 0;
    self.attrs.clear_subtree(path);
    Ok(())
  }

  /// Mark the cell at `path` read-only; writes then fail with
  /// [`Error::Unauthorized`].
  pub fn mark_read_only(&mut self, path: &Path) -> Result<(), Error> {
    let ri = Self::slot_id_for(path);
    let slot = self.instance_mut(path.obj, path.obj_inst)
                   .ok_or(Error::NotFound)?
                   .resource_mut(path.res)
                   .ok_or(Error::NotFound)?
                   .slot_mut(ri)
                   .ok_or(Error::NotFound)?;
    slot.read_only = true;
    Ok(())
  }

  /// Write `value` into the cell at `path`.
  ///
  /// The single checked path every typed setter routes through: validates
  /// the path, refuses read-only cells, runs the pre-write / validate /
  /// post-write hooks, performs the typed copy (with integer truncation
  /// toward the field's width), and — when the value changed and the
  /// field is readable — queues the path for observer notification.
  ///
  /// Returns whether observers care (value changed + readable).
  pub fn set(&mut self, path: &Path, value: Value) -> Result<bool, Error> {
    if path.level < Level::Resource {
      return Err(Error::Invalid);
    }

    let ri = Self::slot_id_for(path);
    let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?.clone();
    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == path.obj)
                      .ok_or(Error::NotFound)?;

    let value = value.coerce(field.kind)?;
    let bytes = value.storage_bytes();

    let changed = {
      let slot = self.resource_instance(path).ok_or(Error::NotFound)?;
      if slot.read_only {
        log::error!("cell is read-only [{}]", path);
        return Err(Error::Unauthorized);
      }

      let max = match field.kind {
        | ResourceKind::String => slot.buf.len().saturating_sub(1),
        | _ => slot.buf.len(),
      };
      if bytes.len() > max {
        log::error!("{}B is too long for the cell at {}", bytes.len(), path);
        return Err(Error::NoMem(Pool::Storage));
      }

      bytes.as_slice() != slot.bytes()
    };

    let handler = &mut self.objects[obj_idx].handler;
    handler.resource(path.obj_inst,
                     ResourceEvent::PreWrite { res_id: path.res,
                                               res_inst_id: ri })?;
    handler.resource(path.obj_inst,
                     ResourceEvent::Validate { res_id: path.res,
                                               res_inst_id: ri,
                                               data: &bytes,
                                               last_block: true })
           .map_err(|_| Error::BadRequest)?;

    {
      let slot = self.instance_mut(path.obj, path.obj_inst)
                     .and_then(|i| i.resource_mut(path.res))
                     .and_then(|r| r.slot_mut(ri))
                     .ok_or(Error::NotFound)?;
      slot.buf[..bytes.len()].copy_from_slice(&bytes);
      if field.kind == ResourceKind::String {
        slot.buf[bytes.len()] = 0;
      }
      slot.len = bytes.len();
    }

    self.objects[obj_idx].handler
                         .resource(path.obj_inst,
                                   ResourceEvent::PostWrite { res_id: path.res,
                                                              res_inst_id: ri,
                                                              data: &bytes,
                                                              last_block: true })?;

    let observable = changed && field.perm.allows(Perm::R);
    if observable {
      self.dirty.push(*path);
    }

    Ok(observable)
  }

  /// Stream one blockwise chunk of an Opaque resource into storage at
  /// `offset`. Hooks see each chunk with `last == false` until the final
  /// one.
  pub(crate) fn write_opaque_chunk(&mut self,
                                   path: &Path,
                                   chunk: &[u8],
                                   offset: usize,
                                   last: bool)
                                   -> Result<(), Error> {
    let ri = Self::slot_id_for(path);
    let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?.clone();
    if field.kind != ResourceKind::Opaque {
      return Err(Error::Invalid);
    }

    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == path.obj)
                      .ok_or(Error::NotFound)?;

    {
      let slot = self.resource_instance(path).ok_or(Error::NotFound)?;
      if slot.read_only {
        return Err(Error::Unauthorized);
      }
      if offset + chunk.len() > slot.buf.len() {
        log::error!("opaque chunk overruns the cell at {}", path);
        return Err(Error::NoMem(Pool::Storage));
      }
    }

    let handler = &mut self.objects[obj_idx].handler;
    handler.resource(path.obj_inst,
                     ResourceEvent::Validate { res_id: path.res,
                                               res_inst_id: ri,
                                               data: chunk,
                                               last_block: last })
           .map_err(|_| Error::BadRequest)?;

    {
      let slot = self.instance_mut(path.obj, path.obj_inst)
                     .and_then(|i| i.resource_mut(path.res))
                     .and_then(|r| r.slot_mut(ri))
                     .ok_or(Error::NotFound)?;
      slot.buf[offset..offset + chunk.len()].copy_from_slice(chunk);
      slot.len = offset + chunk.len();
    }

    self.objects[obj_idx].handler
                         .resource(path.obj_inst,
                                   ResourceEvent::PostWrite { res_id: path.res,
                                                              res_inst_id: ri,
                                                              data: chunk,
                                                              last_block: last })?;

    if last && field.perm.allows(Perm::R) {
      self.dirty.push(*path);
    }

    Ok(())
  }

  /// Read the typed value stored at `path` (no handler involvement).
  pub fn get(&self, path: &Path) -> Result<Value, Error> {
    if path.level < Level::Resource {
      return Err(Error::Invalid);
    }

    let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?;
    let slot = self.resource_instance(path).ok_or(Error::NotFound)?;
    Value::from_storage(field.kind, slot.bytes())
  }

  /// Read for serialization: gives the object's handler a chance to
  /// refresh the value first.
  pub(crate) fn read_with_hook(&mut self, path: &Path) -> Result<Value, Error> {
    let ri = Self::slot_id_for(path);
    let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?.clone();
    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == path.obj)
                      .ok_or(Error::NotFound)?;

    match self.objects[obj_idx].handler
                               .resource(path.obj_inst,
                                         ResourceEvent::Read { res_id: path.res,
                                                               res_inst_id: ri })?
    {
      | Handled::Fresh(v) => v.coerce(field.kind),
      | _ => self.get(path),
    }
  }

  /// Run the Execute operation at `path` (must be resource level).
  pub fn execute(&mut self, path: &Path, args: &[u8]) -> Result<(), Error> {
    if path.level != Level::Resource {
      return Err(Error::Invalid);
    }

    let obj_idx = self.objects
                      .iter()
                      .position(|o| o.id() == path.obj)
                      .ok_or(Error::NotFound)?;
    self.instance(path.obj, path.obj_inst)
        .and_then(|i| i.resource(path.res))
        .ok_or(Error::NotFound)?;

    match self.objects[obj_idx].handler
                               .resource(path.obj_inst,
                                         ResourceEvent::Execute { res_id: path.res,
                                                                  args })?
    {
      | Handled::Ignored => Err(Error::NotFound),
      | _ => Ok(()),
    }
  }

  /// Apply `items` atomically from the caller's view: everything is
  /// validated up front and observers hear nothing unless the whole batch
  /// lands.
  pub fn set_bulk(&mut self, items: Vec<(Path, Value)>) -> Result<(), Error> {
    for (path, value) in items.iter() {
      if path.level < Level::Resource {
        return Err(Error::Invalid);
      }

      let field = self.field(path.obj, path.res).ok_or(Error::NotFound)?;
      let slot = self.resource_instance(path).ok_or(Error::NotFound)?;
      if slot.read_only {
        return Err(Error::Unauthorized);
      }

      let bytes = value.clone().coerce(field.kind)?.storage_bytes();
      let max = match field.kind {
        | ResourceKind::String => slot.buf.len().saturating_sub(1),
        | _ => slot.buf.len(),
      };
      if bytes.len() > max {
        return Err(Error::NoMem(Pool::Storage));
      }
    }

    let parked = core::mem::take(&mut self.dirty);
    let mut applied = Ok(());
    for (path, value) in items {
      if let Err(e) = self.set(&path, value) {
        applied = Err(e);
        break;
      }
    }

    match applied {
      | Ok(()) => {
        let mut restored = parked;
        restored.append(&mut self.dirty);
        self.dirty = restored;
        Ok(())
      },
      | Err(e) => {
        // validated up front, so a failure here is a handler veto;
        // observers hear nothing about the partial batch
        self.dirty = parked;
        Err(e)
      },
    }
  }

  // typed setters

  /// Set an Opaque resource.
  pub fn set_opaque(&mut self, path: &Path, data: &[u8]) -> Result<bool, Error> {
    self.set(path, Value::Opaque(data.to_vec()))
  }

  /// Set a String resource.
  pub fn set_string(&mut self, path: &Path, s: &str) -> Result<bool, Error> {
    self.set(path, Value::String(s.into()))
  }

  #[allow(missing_docs)]
  pub fn set_u8(&mut self, path: &Path, v: u8) -> Result<bool, Error> {
    self.set(path, Value::U8(v))
  }

  #[allow(missing_docs)]
  pub fn set_u16(&mut self, path: &Path, v: u16) -> Result<bool, Error> {
    self.set(path, Value::U16(v))
  }

  #[allow(missing_docs)]
  pub fn set_u32(&mut self, path: &Path, v: u32) -> Result<bool, Error> {
    self.set(path, Value::U32(v))
  }

  #[allow(missing_docs)]
  pub fn set_u64(&mut self, path: &Path, v: u64) -> Result<bool, Error> {
    self.set(path, Value::U64(v))
  }

  #[allow(missing_docs)]
  pub fn set_s8(&mut self, path: &Path, v: i8) -> Result<bool, Error> {
    self.set(path, Value::S8(v))
  }

  #[allow(missing_docs)]
  pub fn set_s16(&mut self, path: &Path, v: i16) -> Result<bool, Error> {
    self.set(path, Value::S16(v))
  }

  #[allow(missing_docs)]
  pub fn set_s32(&mut self, path: &Path, v: i32) -> Result<bool, Error> {
    self.set(path, Value::S32(v))
  }

  #[allow(missing_docs)]
  pub fn set_s64(&mut self, path: &Path, v: i64) -> Result<bool, Error> {
    self.set(path, Value::S64(v))
  }

  #[allow(missing_docs)]
  pub fn set_bool(&mut self, path: &Path, v: bool) -> Result<bool, Error> {
    self.set(path, Value::Bool(v))
  }

  /// Set a Time resource (seconds since the epoch).
  pub fn set_time(&mut self, path: &Path, v: i64) -> Result<bool, Error> {
    self.set(path, Value::Time(v))
  }

  #[allow(missing_docs)]
  pub fn set_float(&mut self, path: &Path, v: f64) -> Result<bool, Error> {
    self.set(path, Value::Float(v))
  }

  #[allow(missing_docs)]
  pub fn set_objlnk(&mut self, path: &Path, v: crate::value::ObjLnk) -> Result<bool, Error> {
    self.set(path, Value::ObjLnk(v))
  }

  // typed getters

  #[allow(missing_docs)]
  pub fn get_opaque(&self, path: &Path) -> Result<Vec<u8>, Error> {
    match self.get(path)? {
      | Value::Opaque(b) => Ok(b),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_string(&self, path: &Path) -> Result<String, Error> {
    match self.get(path)? {
      | Value::String(s) => Ok(s),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_u8(&self, path: &Path) -> Result<u8, Error> {
    match self.get(path)? {
      | Value::U8(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_u16(&self, path: &Path) -> Result<u16, Error> {
    match self.get(path)? {
      | Value::U16(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_u32(&self, path: &Path) -> Result<u32, Error> {
    match self.get(path)? {
      | Value::U32(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_u64(&self, path: &Path) -> Result<u64, Error> {
    match self.get(path)? {
      | Value::U64(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_s8(&self, path: &Path) -> Result<i8, Error> {
    match self.get(path)? {
      | Value::S8(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_s16(&self, path: &Path) -> Result<i16, Error> {
    match self.get(path)? {
      | Value::S16(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_s32(&self, path: &Path) -> Result<i32, Error> {
    match self.get(path)? {
      | Value::S32(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_s64(&self, path: &Path) -> Result<i64, Error> {
    match self.get(path)? {
      | Value::S64(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_bool(&self, path: &Path) -> Result<bool, Error> {
    match self.get(path)? {
      | Value::Bool(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_time(&self, path: &Path) -> Result<i64, Error> {
    match self.get(path)? {
      | Value::Time(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_float(&self, path: &Path) -> Result<f64, Error> {
    match self.get(path)? {
      | Value::Float(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }

  #[allow(missing_docs)]
  pub fn get_objlnk(&self, path: &Path) -> Result<crate::value::ObjLnk, Error> {
    match self.get(path)? {
      | Value::ObjLnk(v) => Ok(v),
      | _ => Err(Error::Invalid),
    }
  }
}
