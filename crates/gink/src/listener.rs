//! Callbacks invoked after a bundle has been stored.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use gink_core::{Bundle, Muid};

/// Callback invoked once per novel bundle.
pub type BundleListener = Arc<dyn Fn(&Bundle) + Send + Sync>;

/// Handle returned by `add_listener`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

struct Registration {
    id: ListenerId,
    container: Option<Muid>,
    remote_only: bool,
    callback: BundleListener,
}

/// Registered listeners, in registration order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    registrations: Vec<Registration>,
}

impl Listeners {
    pub fn add(&mut self, container: Option<Muid>, remote_only: bool, callback: BundleListener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.registrations.push(Registration {
            id,
            container,
            remote_only,
            callback,
        });
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|registration| registration.id != id);
        self.registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Listeners that should see `bundle`.
    ///
    /// Listeners without a container see every bundle; the rest only see
    /// bundles whose entries or clearances touch their container. Remote-only
    /// listeners skip local commits.
    pub fn matching(&self, bundle: &Bundle, remote: bool) -> Vec<BundleListener> {
        let touched = touched_containers(bundle);
        self.registrations
            .iter()
            .filter(|registration| remote || !registration.remote_only)
            .filter(|registration| {
                registration
                    .container
                    .map_or(true, |container| touched.contains(&container))
            })
            .map(|registration| Arc::clone(&registration.callback))
            .collect()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.registrations.len())
            .finish()
    }
}

/// Containers whose contents a bundle changes.
pub fn touched_containers(bundle: &Bundle) -> BTreeSet<Muid> {
    let info = bundle.info();
    bundle
        .changes()
        .iter()
        .filter_map(|change| change.touched_container(info.timestamp, info.medallion))
        .collect()
}
