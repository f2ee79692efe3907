//! The observation engine: per-context observer table, write-attribute
//! inheritance, notification scheduling and cancellation.
//!
//! Observers live on the engine's context; each holds a sorted path list
//! (one entry for a classic observe, several for a composite one), the
//! token the server chose, and the timestamps that drive `pmin`/`pmax`
//! rate gating.

use toad_msg::{ContentFormat, MessageOptions, OptValue, Token, Type};

use crate::engine::{Engine, Notice, Outgoing};
use crate::error::{Error, Pool};
use crate::msg::{self, code, Packet, ReplyKind};
use crate::obj::server;
use crate::path::{Level, Path, PathList};
use crate::platform::PlatformTypes;
use crate::registry::{attr, Perm, Registry};
use crate::{codec, request};

/// The Observe counter wraps at 24 bits.
pub const OBSERVE_COUNTER_WRAP: u32 = 1 << 24;

/// One observation: a server's subscription to a path list.
#[derive(Debug, Clone)]
pub(crate) struct Observer {
  pub(crate) token: Token,
  pub(crate) path_list: PathList,
  pub(crate) format: ContentFormat,
  pub(crate) counter: u32,
  pub(crate) last_timestamp: u64,
  pub(crate) event_timestamp: Option<u64>,
  pub(crate) resource_update: bool,
  pub(crate) active_tx: bool,
  pub(crate) composite: bool,
}

/// Effective notification attributes at a path, after inheritance.
///
/// `pmin`/`pmax` of zero mean "not set"; the deepest value on the path
/// chain wins, falling back to the Server object's defaults.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct NotificationAttrs {
  /// minimum seconds between notifications
  pub pmin: i32,
  /// maximum seconds between notifications (0 = no periodic notify)
  pub pmax: i32,
  #[allow(missing_docs)]
  pub gt: Option<f64>,
  #[allow(missing_docs)]
  pub lt: Option<f64>,
  #[allow(missing_docs)]
  pub st: Option<f64>,
}

impl NotificationAttrs {
  fn apply(&mut self, attr: attr::Attr) {
    match attr {
      | attr::Attr::Pmin(v) => self.pmin = v,
      | attr::Attr::Pmax(v) => self.pmax = v,
      | attr::Attr::Gt(v) => self.gt = Some(v),
      | attr::Attr::Lt(v) => self.lt = Some(v),
      | attr::Attr::St(v) => self.st = Some(v),
    }
  }

  fn apply_all(&mut self, registry: &Registry, anchor: &Path) {
    for a in registry.attrs().of(anchor) {
      self.apply(a);
    }
  }
}

/// Walk the attribute chain for `path`: Server-object defaults, then
/// object, instance, resource and resource-instance anchors, deepest
/// winning.
pub(crate) fn gather_attrs(registry: &Registry,
                           path: &Path,
                           srv_obj_inst: Option<u16>)
                           -> Result<NotificationAttrs, Error> {
  let mut attrs = NotificationAttrs::default();
  if let Some(srv) = srv_obj_inst {
    attrs.pmin = server::default_pmin(registry, srv);
    attrs.pmax = server::default_pmax(registry, srv);
  }

  registry.object(path.obj).ok_or(Error::NotFound)?;
  attrs.apply_all(registry, &Path::object(path.obj));

  if path.level >= Level::ObjectInstance {
    if registry.instance(path.obj, path.obj_inst).is_none() {
      attrs.pmin = 0;
      attrs.pmax = 0;
      return Ok(attrs);
    }
    attrs.apply_all(registry, &Path::instance(path.obj, path.obj_inst));
  }

  if path.level >= Level::Resource {
    let field = registry.field(path.obj, path.res).ok_or(Error::NotFound)?;
    if !field.perm.allows(Perm::R) {
      return Err(Error::NotAllowed);
    }
    attrs.apply_all(registry, &Path::resource(path.obj, path.obj_inst, path.res));
  }

  if path.level == Level::ResourceInstance {
    registry.resource_instance(path).ok_or(Error::NotFound)?;
    attrs.apply_all(registry, path);
  }

  if attrs.pmax < attrs.pmin {
    attrs.pmax = 0;
  }

  Ok(attrs)
}

/// Merge attributes across a path list: the smallest non-zero `pmin` and
/// `pmax` win.
pub(crate) fn gather_attrs_list(registry: &Registry,
                                list: &PathList,
                                srv_obj_inst: Option<u16>)
                                -> Result<NotificationAttrs, Error> {
  let mut pmin = 0;
  let mut pmax = 0;

  for path in list.iter() {
    let attrs = gather_attrs(registry, path, srv_obj_inst)?;
    if attrs.pmin != 0 {
      pmin = if pmin == 0 { attrs.pmin } else { pmin.min(attrs.pmin) };
    }
    if attrs.pmax != 0 {
      pmax = if pmax == 0 { attrs.pmax } else { pmax.min(attrs.pmax) };
    }
  }

  Ok(NotificationAttrs { pmin,
                         pmax,
                         ..Default::default() })
}

impl<P: PlatformTypes> Engine<P> {
  fn observer_paths(&self, idx: usize) -> Path {
    self.ctx.observers[idx].path_list
                           .first()
                           .copied()
                           .unwrap_or_else(Path::root)
  }

  /// Install (or refresh) an observer for a single path.
  ///
  /// A duplicate subscription to the same path list silently refreshes the
  /// token, like the original.
  pub(crate) fn add_observer(&mut self,
                             token: Token,
                             path: Path,
                             format: ContentFormat,
                             now: u64)
                             -> Result<(), Error> {
    self.add_observer_list(token, PathList::single(path), format, false, now)
  }

  /// Install (or refresh) a composite observer for a parsed path list.
  pub(crate) fn add_composite_observer(&mut self,
                                       token: Token,
                                       list: PathList,
                                       format: ContentFormat,
                                       now: u64)
                                       -> Result<(), Error> {
    self.add_observer_list(token, list, format, true, now)
  }

  fn add_observer_list(&mut self,
                       token: Token,
                       list: PathList,
                       format: ContentFormat,
                       composite: bool,
                       now: u64)
                       -> Result<(), Error> {
    if token.0.is_empty() || token.0.len() > 8 {
      return Err(Error::Invalid);
    }

    if let Some(existing) = self.ctx
                                .observers
                                .iter_mut()
                                .find(|o| o.path_list == list)
    {
      log::debug!("observer duplicate, refreshing token");
      existing.token = token;
      return Ok(());
    }

    let attrs = gather_attrs_list(&self.registry, &list, self.ctx.srv_obj_inst)?;

    if self.ctx.observers.len() >= self.config.tables.observers {
      return Err(Error::NoMem(Pool::Observer));
    }

    let event_timestamp = (attrs.pmax > 0).then(|| now + attrs.pmax as u64 * 1_000);
    let first = list.first().copied().unwrap_or_else(Path::root);
    self.ctx.observers.push(Observer { token,
                                       path_list: list,
                                       format,
                                       counter: 0,
                                       last_timestamp: now,
                                       event_timestamp,
                                       resource_update: false,
                                       active_tx: false,
                                       composite });

    log::debug!("observer added {}", first);
    self.notice(Notice::ObserverAdded(first));
    Ok(())
  }

  /// Cancel the observation the server opened with `token`.
  pub(crate) fn remove_observer_by_token(&mut self, token: Token) -> Result<(), Error> {
    let idx = self.ctx
                  .observers
                  .iter()
                  .position(|o| o.token == token)
                  .ok_or(Error::NotFound)?;
    let path = self.observer_paths(idx);
    self.ctx.observers.remove(idx);
    log::debug!("observer removed {}", path);
    self.notice(Notice::ObserverRemoved(path));
    Ok(())
  }

  /// Cancel-by-path fallback for peers that send `Observe: 1` with a fresh
  /// token.
  pub(crate) fn remove_observer_by_path(&mut self, path: &Path) -> Result<(), Error> {
    let list = PathList::single(*path);
    let idx = self.ctx
                  .observers
                  .iter()
                  .position(|o| o.path_list == list)
                  .ok_or(Error::NotFound)?;
    self.ctx.observers.remove(idx);
    log::debug!("observer removed {}", path);
    self.notice(Notice::ObserverRemoved(*path));
    Ok(())
  }

  /// Evict observers watching an object (or one instance of it); used by
  /// instance delete and object unregister.
  pub(crate) fn remove_observers_by_id(&mut self, obj_id: u16, inst_id: Option<u16>) {
    let prefix = match inst_id {
      | Some(inst) => Path::instance(obj_id, inst),
      | None => Path::object(obj_id),
    };

    let mut removed: Vec<Path> = vec![];
    self.ctx.observers.retain_mut(|o| {
                        if o.path_list.remove_subtree(&prefix) && o.path_list.is_empty() {
                          removed.push(prefix);
                          return false;
                        }
                        true
                      });

    for p in removed {
      self.notice(Notice::ObserverRemoved(p));
    }
  }

  /// A readable value under `path` changed: bring forward the event
  /// timestamp of every observer whose list covers it, honoring `pmin`.
  pub(crate) fn notify_observer_path(&mut self, path: &Path, now: u64) {
    if path.level < Level::Resource {
      return;
    }

    for idx in 0..self.ctx.observers.len() {
      if !self.ctx.observers[idx].path_list.matches(path) {
        continue;
      }

      let attrs = match gather_attrs_list(&self.registry,
                                          &self.ctx.observers[idx].path_list,
                                          self.ctx.srv_obj_inst)
      {
        | Ok(a) => a,
        | Err(e) => {
          log::warn!("attribute walk failed for {}: {:?}", path, e);
          continue;
        },
      };

      let o = &mut self.ctx.observers[idx];
      let timestamp = if attrs.pmin > 0 {
        o.last_timestamp + attrs.pmin as u64 * 1_000
      } else {
        now
      };

      if o.event_timestamp.map(|t| t > timestamp).unwrap_or(true) {
        o.resource_update = true;
        o.event_timestamp = Some(timestamp);
      }

      log::debug!("notify event {}", path);
    }
  }

  /// pmin/pmax attributes changed somewhere under `path`: recompute every
  /// affected observer's automatic event time.
  pub(crate) fn observers_timestamp_update(&mut self, path: &Path) {
    for idx in 0..self.ctx.observers.len() {
      if !self.ctx.observers[idx].path_list.matches(path) {
        continue;
      }

      let attrs = match gather_attrs_list(&self.registry,
                                          &self.ctx.observers[idx].path_list,
                                          self.ctx.srv_obj_inst)
      {
        | Ok(a) => a,
        | Err(_) => continue,
      };

      let o = &mut self.ctx.observers[idx];
      o.event_timestamp = (attrs.pmax > 0).then(|| o.last_timestamp + attrs.pmax as u64 * 1_000);
    }
  }

  /// The soonest observer event, for the service loop's timeout.
  pub(crate) fn next_observe_event_ms(&self) -> Option<u64> {
    self.ctx
        .observers
        .iter()
        .filter(|o| !o.active_tx)
        .filter_map(|o| o.event_timestamp)
        .min()
  }

  /// Emit every notification whose time has come.
  pub(crate) fn check_notifications(&mut self, now: u64) {
    for idx in 0..self.ctx.observers.len() {
      let due = {
        let o = &self.ctx.observers[idx];
        !o.active_tx && o.event_timestamp.map(|t| now >= t).unwrap_or(false)
      };

      if due {
        if let Err(e) = self.generate_notify(idx, now) {
          log::error!("notify generation failed: {:?}", e);
        }
      }
    }
  }

  fn generate_notify(&mut self, idx: usize, now: u64) -> Result<(), Error> {
    let (token, format, composite, manual, list) = {
      let o = &self.ctx.observers[idx];
      (o.token, o.format, o.composite, o.resource_update, o.path_list.clone())
    };

    log::debug!("[{}] notify msg start {}",
                if manual { "manual" } else { "auto" },
                list.first().map(|p| p.to_string()).unwrap_or_default());

    let mid = self.next_mid();
    let mut packet = Packet::new(Type::Con, code::CONTENT, mid, token);

    let counter = {
      let o = &mut self.ctx.observers[idx];
      o.counter = (o.counter + 1) % OBSERVE_COUNTER_WRAP;
      o.counter
    };
    MessageOptions::set(&mut packet,
                        toad_msg::no_repeat::OBSERVE,
                        OptValue(msg::encode_uint_option(counter).into_iter().collect()))
                  .map_err(|_| Error::NoMem(Pool::Payload))?;
    packet.set_content_format(format)
          .map_err(|_| Error::NoMem(Pool::Payload))?;

    let mut writer = codec::select_writer(format)?;
    let mut out = codec::OutBuf::new(self.config.transfer.max_payload);
    if composite {
      request::composite_read_to_payload(&mut self.registry, &list, writer.as_mut(), &mut out)?;
    } else {
      let path = list.first().copied().ok_or(Error::Invalid)?;
      request::read_to_payload(&mut self.registry, &path, writer.as_mut(), &mut out)?;
    }
    packet.payload = toad_msg::Payload(out.into_vec());

    {
      let o = &mut self.ctx.observers[idx];
      o.active_tx = true;
      o.resource_update = false;
      o.last_timestamp = now;
    }

    let attrs = gather_attrs_list(&self.registry,
                                  &self.ctx.observers[idx].path_list,
                                  self.ctx.srv_obj_inst).unwrap_or_default();
    self.ctx.observers[idx].event_timestamp =
      (attrs.pmax > 0).then(|| now + attrs.pmax as u64 * 1_000);

    self.information_interface_send(Outgoing::new(packet, Some(ReplyKind::Notify)));
    log::debug!("notify msg sent");
    Ok(())
  }

  /// The server ACKed a NOTIFY.
  pub(crate) fn notify_replied(&mut self, token: Token) {
    if let Some(idx) = self.ctx.observers.iter().position(|o| o.token == token) {
      self.ctx.observers[idx].active_tx = false;
      let path = self.observer_paths(idx);
      self.notice(Notice::NotifyAck(path));
    }
  }

  /// The server answered a NOTIFY with RESET: the observation is dead.
  pub(crate) fn notify_reset(&mut self, token: Token) {
    if token.0.is_empty() {
      log::error!("notify reply missing token -- ignored");
      return;
    }

    if self.remove_observer_by_token(token).is_err() {
      log::error!("reset for unknown observer");
    }
  }

  /// A NOTIFY ran out of retransmissions: tell the app and kick the
  /// registration machine into re-registering.
  pub(crate) fn notify_timed_out(&mut self, token: Token) {
    if let Some(idx) = self.ctx.observers.iter().position(|o| o.token == token) {
      self.ctx.observers[idx].active_tx = false;
      let path = self.observer_paths(idx);
      self.notice(Notice::NotifyTimeout(path));
    }

    log::error!("notify message timed out");
    self.rd_client_timeout();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::registry::{attr::Attr, Field, Object, Registry};
  use crate::value::ResourceKind;

  fn registry() -> Registry {
    let mut reg = Registry::new(&Config::default());
    reg.register_object(crate::obj::server::object()).unwrap();
    reg.create_instance(1, 0).unwrap();
    reg.register_object(Object::new(3303,
                                    (1, 0),
                                    vec![Field::new(5700, ResourceKind::Float, Perm::R),
                                         Field::new(5750, ResourceKind::String, Perm::W)],
                                    2))
       .unwrap();
    reg.create_instance(3303, 0).unwrap();
    reg
  }

  #[test]
  fn attrs_inherit_deepest_wins() {
    let mut reg = registry();
    reg.set_u32(&"/1/0/2".parse().unwrap(), 10).unwrap(); // server default pmin
    reg.set_u32(&"/1/0/3".parse().unwrap(), 60).unwrap(); // server default pmax
    reg.attrs_mut()
       .set(Path::object(3303), Attr::Pmin(5))
       .unwrap();
    reg.attrs_mut()
       .set(Path::resource(3303, 0, 5700), Attr::Pmin(2))
       .unwrap();

    let attrs = gather_attrs(&reg, &Path::resource(3303, 0, 5700), Some(0)).unwrap();
    assert_eq!(attrs.pmin, 2, "resource anchor beats object and defaults");
    assert_eq!(attrs.pmax, 60, "server default still applies");

    let attrs = gather_attrs(&reg, &Path::instance(3303, 0), Some(0)).unwrap();
    assert_eq!(attrs.pmin, 5, "object anchor inherited by the instance");
  }

  #[test]
  fn pmax_below_pmin_is_dropped() {
    let mut reg = registry();
    reg.attrs_mut()
       .set(Path::resource(3303, 0, 5700), Attr::Pmin(30))
       .unwrap();
    reg.attrs_mut()
       .set(Path::resource(3303, 0, 5700), Attr::Pmax(10))
       .unwrap();

    let attrs = gather_attrs(&reg, &Path::resource(3303, 0, 5700), Some(0)).unwrap();
    assert_eq!(attrs.pmax, 0);
  }

  #[test]
  fn unreadable_resources_cannot_be_observed() {
    let reg = registry();
    assert_eq!(gather_attrs(&reg, &Path::resource(3303, 0, 5750), Some(0)),
               Err(Error::NotAllowed));
  }

  #[test]
  fn missing_instance_disables_periodics_but_is_not_an_error() {
    let reg = registry();
    let attrs = gather_attrs(&reg, &Path::instance(3303, 7), Some(0)).unwrap();
    assert_eq!((attrs.pmin, attrs.pmax), (0, 0));
  }

  #[test]
  fn list_merge_takes_smallest_nonzero() {
    let mut reg = registry();
    reg.attrs_mut()
       .set(Path::resource(3303, 0, 5700), Attr::Pmax(60))
       .unwrap();
    reg.attrs_mut()
       .set(Path::object(3303), Attr::Pmax(30))
       .unwrap();

    let mut list = PathList::new(4);
    list.insert(Path::resource(3303, 0, 5700)).unwrap();
    list.insert(Path::object(1)).unwrap();

    let attrs = gather_attrs_list(&reg, &list, Some(0)).unwrap();
    assert_eq!(attrs.pmax, 60);
  }
}
