use super::*;

/// A peripheral seen while scanning.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub peripheral: Uuid,
    pub advertisement_data: AdvertisementData,
    pub rssi: i32,
}

assert_impl_all!(Discovery: Send, Sync);

pub type DiscoveryHandler = Box<dyn FnMut(Discovery) + Send>;
pub type ErrorHandler = Box<dyn FnOnce(Error) + Send>;

pub(in crate) struct ScanSession {
    pub services: Vec<Uuid>,
    pub options: ScanOptions,
    on_discovered: DiscoveryHandler,
    on_error: Option<ErrorHandler>,
}

impl ScanSession {
    pub fn new(services: Vec<Uuid>,
        options: ScanOptions,
        on_discovered: DiscoveryHandler,
        on_error: Option<ErrorHandler>) -> Self
    {
        Self {
            services,
            options,
            on_discovered,
            on_error,
        }
    }

    /// An empty filter matches every peripheral.
    pub fn matches(&self, advertisement_data: &AdvertisementData) -> bool {
        self.services.is_empty()
            || self.services.iter().any(|&s| advertisement_data.advertises(s))
    }

    pub fn discovered(&mut self, discovery: Discovery) {
        (self.on_discovered)(discovery);
    }

    pub fn fail(self, error: Error) {
        if let Some(on_error) = self.on_error {
            on_error(error);
        }
    }
}
