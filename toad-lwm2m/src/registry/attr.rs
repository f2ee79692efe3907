use crate::error::{Error, Pool as ErrPool};
use crate::path::Path;

/// The five write-attributes a server can anchor on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrKind {
  /// minimum seconds between notifications
  Pmin,
  /// maximum seconds between notifications
  Pmax,
  /// notify when the value crosses this from below
  Gt,
  /// notify when the value crosses this from above
  Lt,
  /// notify when the value moves by at least this much
  St,
}

impl AttrKind {
  /// The URI-Query name of this attribute.
  pub fn name(&self) -> &'static str {
    match self {
      | AttrKind::Pmin => "pmin",
      | AttrKind::Pmax => "pmax",
      | AttrKind::Gt => "gt",
      | AttrKind::Lt => "lt",
      | AttrKind::St => "st",
    }
  }

  /// `gt`/`lt`/`st` only make sense where there is a numeric value, so
  /// they may not be anchored on objects or object instances.
  pub fn needs_resource_level(&self) -> bool {
    matches!(self, AttrKind::Gt | AttrKind::Lt | AttrKind::St)
  }
}

/// One attribute with its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attr {
  /// seconds
  Pmin(i32),
  /// seconds
  Pmax(i32),
  #[allow(missing_docs)]
  Gt(f64),
  #[allow(missing_docs)]
  Lt(f64),
  #[allow(missing_docs)]
  St(f64),
}

impl Attr {
  /// Which attribute this is.
  pub fn kind(&self) -> AttrKind {
    match self {
      | Attr::Pmin(_) => AttrKind::Pmin,
      | Attr::Pmax(_) => AttrKind::Pmax,
      | Attr::Gt(_) => AttrKind::Gt,
      | Attr::Lt(_) => AttrKind::Lt,
      | Attr::St(_) => AttrKind::St,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
  path: Path,
  attr: Attr,
}

/// The bounded pool of write-attributes, keyed by the path they annotate.
///
/// The original anchors attributes on raw object/instance/resource pointers;
/// a [`Path`] carries the same information without the aliasing.
#[derive(Debug, Clone)]
pub struct Pool {
  entries: Vec<Entry>,
  capacity: usize,
}

impl Pool {
  /// An empty pool of `capacity` attributes.
  pub fn new(capacity: usize) -> Self {
    Pool { entries: Vec::with_capacity(capacity),
           capacity }
  }

  /// Set (update or allocate) an attribute on `path`.
  pub fn set(&mut self, path: Path, attr: Attr) -> Result<(), Error> {
    if let Some(e) = self.entries
                         .iter_mut()
                         .find(|e| e.path == path && e.attr.kind() == attr.kind())
    {
      e.attr = attr;
      return Ok(());
    }

    if self.entries.len() == self.capacity {
      return Err(Error::NoMem(ErrPool::Attribute));
    }

    log::debug!("attr {} := {:?} on {}", attr.kind().name(), attr, path);
    self.entries.push(Entry { path, attr });
    Ok(())
  }

  /// Remove one attribute from `path`, reporting whether it was set.
  pub fn unset(&mut self, path: &Path, kind: AttrKind) -> bool {
    let before = self.entries.len();
    self.entries
        .retain(|e| !(e.path == *path && e.attr.kind() == kind));
    before != self.entries.len()
  }

  /// The attributes anchored exactly on `path` (no inheritance).
  pub fn of<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = Attr> + 'a {
    self.entries
        .iter()
        .filter(move |e| e.path == *path)
        .map(|e| e.attr)
  }

  /// One attribute of `path`, if set.
  pub fn get(&self, path: &Path, kind: AttrKind) -> Option<Attr> {
    self.of(path).find(|a| a.kind() == kind)
  }

  /// Drop every attribute anchored on `prefix` or below. Called when
  /// instances die so stale anchors can't leak into new instances.
  pub fn clear_subtree(&mut self, prefix: &Path) {
    self.entries.retain(|e| !prefix.is_prefix_of(&e.path));
  }

  #[allow(missing_docs)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[allow(missing_docs)]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_updates_in_place() {
    let mut pool = Pool::new(2);
    let p = Path::resource(3303, 0, 5700);
    pool.set(p, Attr::Pmin(5)).unwrap();
    pool.set(p, Attr::Pmin(10)).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.get(&p, AttrKind::Pmin), Some(Attr::Pmin(10)));
  }

  #[test]
  fn pool_is_bounded() {
    let mut pool = Pool::new(1);
    pool.set(Path::object(3), Attr::Pmax(60)).unwrap();
    assert_eq!(pool.set(Path::object(4), Attr::Pmax(60)),
               Err(Error::NoMem(ErrPool::Attribute)));
  }

  #[test]
  fn clear_subtree_takes_resources_with_the_instance() {
    let mut pool = Pool::new(8);
    pool.set(Path::instance(3303, 0), Attr::Pmax(60)).unwrap();
    pool.set(Path::resource(3303, 0, 5700), Attr::Gt(30.0)).unwrap();
    pool.set(Path::resource(3303, 1, 5700), Attr::Lt(0.0)).unwrap();

    pool.clear_subtree(&Path::instance(3303, 0));

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.get(&Path::resource(3303, 1, 5700), AttrKind::Lt),
               Some(Attr::Lt(0.0)));
  }
}
