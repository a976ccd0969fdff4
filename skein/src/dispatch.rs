//! Provider choice per operation.

/// Where the peer runs relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    SameHost,
    Remote,
}

/// Message size relative to the shared-memory provider's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBucket {
    Small,
    Large,
}

/// Kind of provider an operation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Shm,
    Network,
}

/// Routes for every `(locality, size, device buffer)` combination, fixed at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    shm_max_msg_size: usize,
    routes: [[[Option<Route>; 2]; 2]; 2],
}

impl DispatchTable {
    /// Shared memory serves same-host peers up to its size limit, and device
    /// buffers only when it handles device memory. Everything else goes to
    /// the network when one is open.
    pub fn build(shm: Option<ShmCaps>, network: bool) -> Self {
        let mut routes = [[[None; 2]; 2]; 2];
        for (l, locality) in [Locality::SameHost, Locality::Remote].into_iter().enumerate() {
            for (s, size) in [SizeBucket::Small, SizeBucket::Large].into_iter().enumerate() {
                for (d, device) in [false, true].into_iter().enumerate() {
                    routes[l][s][d] = Self::decide(shm, network, locality, size, device);
                }
            }
        }
        Self {
            shm_max_msg_size: shm.map_or(0, |c| c.max_msg_size),
            routes,
        }
    }

    fn decide(
        shm: Option<ShmCaps>,
        network: bool,
        locality: Locality,
        size: SizeBucket,
        device: bool,
    ) -> Option<Route> {
        let shm_fits = shm.is_some_and(|c| {
            locality == Locality::SameHost && size == SizeBucket::Small && (!device || c.hmem)
        });
        if shm_fits {
            return Some(Route::Shm);
        }
        if network {
            return Some(Route::Network);
        }
        // shm-only job: every peer is local, let the provider judge the rest
        (shm.is_some() && locality == Locality::SameHost).then_some(Route::Shm)
    }

    pub fn bucket(&self, len: usize) -> SizeBucket {
        if len <= self.shm_max_msg_size {
            SizeBucket::Small
        } else {
            SizeBucket::Large
        }
    }

    pub fn route(&self, locality: Locality, len: usize, device: bool) -> Option<Route> {
        let l = (locality == Locality::Remote) as usize;
        let s = (self.bucket(len) == SizeBucket::Large) as usize;
        self.routes[l][s][device as usize]
    }
}

/// What dispatch needs to know about the shared-memory provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmCaps {
    pub max_msg_size: usize,
    pub hmem: bool,
}
