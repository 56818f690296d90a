//! Build-time adapter registry.
//!
//! Adapters register by name here; the supervisor starts only the ones
//! listed in `enabled_adapters`. Unknown names in config are warnings at
//! the call site, not errors.

use std::sync::Arc;

use crate::essl::EsslAdapter;
use crate::realtime::RealtimeAdapter;
use crate::simulator::SimulatorAdapter;
use crate::zkteco::ZkTecoAdapter;
use crate::{HardwareAdapter, essl, realtime, simulator, zkteco};

/// Names of every built-in adapter.
#[must_use]
pub fn known_adapters() -> &'static [&'static str] {
    &[simulator::NAME, zkteco::NAME, essl::NAME, realtime::NAME]
}

/// Instantiate a built-in adapter by name.
#[must_use]
pub fn create(name: &str) -> Option<Arc<dyn HardwareAdapter>> {
    match name {
        simulator::NAME => Some(Arc::new(SimulatorAdapter)),
        zkteco::NAME => Some(Arc::new(ZkTecoAdapter::default())),
        essl::NAME => Some(Arc::new(EsslAdapter)),
        realtime::NAME => Some(Arc::new(RealtimeAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_adapter_instantiates() {
        for name in known_adapters() {
            let adapter = create(name).unwrap_or_else(|| unreachable!("known adapter {name}"));
            assert_eq!(adapter.info().name, *name);
        }
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(create("suprema").is_none());
    }
}
