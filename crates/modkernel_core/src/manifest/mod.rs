//! Layered manifest stacks and thread-visible activation.
//!
//! # Responsibility
//! - Keep one ordered stack of snapshots per domain (classes, modules,
//!   config, services).
//! - Provide copy-on-write nesting of the top frame.
//! - Track which loader is active for each domain on the current thread.
//!
//! # Invariants
//! - Lower frames are shared between a loader and its nested children.
//! - Mutating a child's top frame never changes the parent's top frame.
//! - At most one loader per domain is active at a time.

pub mod class;
pub mod discovery;
pub mod module;

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

/// Domain a manifest snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestDomain {
    Classes,
    Modules,
    Config,
    Services,
}

impl ManifestDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classes => "classes",
            Self::Modules => "modules",
            Self::Config => "config",
            Self::Services => "services",
        }
    }
}

impl Display for ManifestDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot type that can live in a [`ManifestLoader`].
///
/// `Default` is the lazily-constructed empty manifest; `Clone` is used for
/// copy-on-write of the top frame.
pub trait Manifest: Clone + Default + 'static {
    const DOMAIN: ManifestDomain;
}

/// Shared handle to a loader; kernels hold one per domain.
pub type LoaderHandle<M> = Rc<RefCell<ManifestLoader<M>>>;

/// Ordered stack of manifest snapshots; the last frame is current.
pub struct ManifestLoader<M> {
    stack: Vec<Rc<M>>,
}

impl<M: Manifest> ManifestLoader<M> {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    pub fn with_manifest(manifest: M) -> Self {
        Self {
            stack: vec![Rc::new(manifest)],
        }
    }

    pub fn into_handle(self) -> LoaderHandle<M> {
        Rc::new(RefCell::new(self))
    }

    /// Pushes a new current frame.
    pub fn push_manifest(&mut self, manifest: M) {
        self.stack.push(Rc::new(manifest));
    }

    /// Pushes an already shared snapshot without copying it.
    pub fn push_shared(&mut self, manifest: Rc<M>) {
        self.stack.push(manifest);
    }

    /// Removes and returns the current frame.
    pub fn pop_manifest(&mut self) -> Option<Rc<M>> {
        self.stack.pop()
    }

    /// Returns the current frame, pushing an empty default when the stack is
    /// empty.
    pub fn manifest(&mut self) -> Rc<M> {
        Rc::clone(self.ensure_top())
    }

    /// Returns the current frame without constructing a default.
    pub fn current(&self) -> Option<Rc<M>> {
        self.stack.last().cloned()
    }

    /// Mutable access to the current frame.
    ///
    /// Copies the frame first when any other loader or reader still holds it.
    pub fn manifest_mut(&mut self) -> &mut M {
        Rc::make_mut(self.ensure_top())
    }

    pub fn has_manifest(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns a child loader sharing every lower frame with `self` and
    /// owning an independent copy of the top frame.
    pub fn nest(&self) -> Self {
        let mut stack = self.stack.clone();
        if let Some(top) = stack.last_mut() {
            *top = Rc::new(M::clone(top));
        }
        Self { stack }
    }

    /// Whether frame `index` (0 = bottom) is the same snapshot in both loaders.
    pub fn shares_frame_with(&self, other: &Self, index: usize) -> bool {
        match (self.stack.get(index), other.stack.get(index)) {
            (Some(left), Some(right)) => Rc::ptr_eq(left, right),
            _ => false,
        }
    }

    fn ensure_top(&mut self) -> &mut Rc<M> {
        if self.stack.is_empty() {
            self.stack.push(Rc::new(M::default()));
        }
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }
}

impl<M: Manifest> Default for ManifestLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Manifest> Debug for ManifestLoader<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestLoader")
            .field("domain", &M::DOMAIN)
            .field("depth", &self.stack.len())
            .finish()
    }
}

thread_local! {
    static ACTIVE_LOADERS: RefCell<BTreeMap<ManifestDomain, Rc<dyn Any>>> =
        RefCell::new(BTreeMap::new());
}

/// Makes `handle` the loader consulted by ambient lookups for its domain.
pub fn activate<M: Manifest>(handle: &LoaderHandle<M>) {
    let erased: Rc<dyn Any> = handle.clone();
    ACTIVE_LOADERS.with(|slots| {
        slots.borrow_mut().insert(M::DOMAIN, erased);
    });
}

/// Returns the active loader for domain `M`.
pub fn active<M: Manifest>() -> Option<LoaderHandle<M>> {
    let erased = ACTIVE_LOADERS.with(|slots| slots.borrow().get(&M::DOMAIN).cloned())?;
    erased.downcast::<RefCell<ManifestLoader<M>>>().ok()
}

/// Returns the current frame of the active loader for domain `M`.
pub fn active_manifest<M: Manifest>() -> Option<Rc<M>> {
    let handle = active::<M>()?;
    let manifest = handle.borrow_mut().manifest();
    Some(manifest)
}

/// Whether `handle` is the active loader of its domain.
pub fn is_active<M: Manifest>(handle: &LoaderHandle<M>) -> bool {
    active::<M>().is_some_and(|current| Rc::ptr_eq(&current, handle))
}

/// Clears the domain slot when it still points at `handle`.
pub fn deactivate<M: Manifest>(handle: &LoaderHandle<M>) -> bool {
    if !is_active(handle) {
        return false;
    }
    ACTIVE_LOADERS.with(|slots| {
        slots.borrow_mut().remove(&M::DOMAIN);
    });
    true
}

/// Clears every activation slot on this thread.
pub fn reset_active() {
    ACTIVE_LOADERS.with(|slots| slots.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::{active, active_manifest, activate, deactivate, reset_active, Manifest};
    use super::{ManifestDomain, ManifestLoader};

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Notes {
        items: Vec<String>,
    }

    impl Manifest for Notes {
        const DOMAIN: ManifestDomain = ManifestDomain::Config;
    }

    #[test]
    fn manifest_is_created_lazily() {
        let mut loader = ManifestLoader::<Notes>::new();
        assert!(!loader.has_manifest());
        assert!(loader.manifest().items.is_empty());
        assert!(loader.has_manifest());
        assert_eq!(loader.depth(), 1);
    }

    #[test]
    fn nested_top_is_independent_and_lower_frames_are_shared() {
        let mut parent = ManifestLoader::with_manifest(Notes {
            items: vec!["base".to_string()],
        });
        parent.push_manifest(Notes {
            items: vec!["top".to_string()],
        });

        let mut child = parent.nest();
        assert!(child.shares_frame_with(&parent, 0));
        assert!(!child.shares_frame_with(&parent, 1));

        child.manifest_mut().items.push("child".to_string());
        assert_eq!(parent.manifest().items, vec!["top".to_string()]);
        assert_eq!(
            child.manifest().items,
            vec!["top".to_string(), "child".to_string()]
        );
    }

    #[test]
    fn manifest_mut_copies_frames_held_by_readers() {
        let mut loader = ManifestLoader::with_manifest(Notes::default());
        let snapshot = loader.manifest();
        loader.manifest_mut().items.push("edit".to_string());
        assert!(snapshot.items.is_empty());
        assert_eq!(loader.manifest().items.len(), 1);
    }

    #[test]
    fn activation_tracks_latest_handle() {
        reset_active();
        let first = ManifestLoader::with_manifest(Notes {
            items: vec!["first".to_string()],
        })
        .into_handle();
        let second = first.borrow().nest().into_handle();
        second.borrow_mut().manifest_mut().items.push("second".to_string());

        activate(&first);
        assert_eq!(active_manifest::<Notes>().expect("active").items.len(), 1);
        activate(&second);
        assert_eq!(active_manifest::<Notes>().expect("active").items.len(), 2);

        assert!(!deactivate(&first));
        assert!(deactivate(&second));
        assert!(active::<Notes>().is_none());
    }
}
