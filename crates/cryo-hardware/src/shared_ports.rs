//! Registry of open instrument lines.
//!
//! Every instrument on an ISOBUS line, and every gateway slave behind a
//! gateway master, talks through the same physical port. Links look the port
//! up here by resource path so it is opened once and closed when the last
//! link releases it.

use cryo_core::error::{CryoError, CryoResult};
use cryo_core::serial::{LineSettings, SharedPort};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static SHARED_PORTS: OnceLock<RwLock<HashMap<String, SharedPort>>> = OnceLock::new();

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

fn port_registry() -> &'static RwLock<HashMap<String, SharedPort>> {
    SHARED_PORTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Port already open on `port_path`, if any.
pub fn get_existing_port(port_path: &str) -> Option<SharedPort> {
    port_registry().read().get(port_path).cloned()
}

/// Registers a port opened elsewhere (simulators, bridges).
pub fn register_port(port_path: &str, port: SharedPort) {
    port_registry().write().insert(port_path.to_string(), port);
    tracing::info!(port = port_path, "Registered shared instrument line");
}

/// Drops a port from the registry.
pub fn remove_port(port_path: &str) -> bool {
    let removed = port_registry().write().remove(port_path).is_some();
    if removed {
        tracing::info!(port = port_path, "Removed shared instrument line");
    }
    removed
}

/// Returns the open port on `port_path`, opening and registering it when
/// absent or unhealthy.
///
/// A port that is already open keeps its original line settings.
pub async fn get_or_open_port(
    port_path: &str,
    settings: &LineSettings,
    device: &str,
) -> CryoResult<SharedPort> {
    use tokio::io::AsyncWriteExt;

    if let Some(port) = get_existing_port(port_path) {
        let health_check = async {
            let mut guard = port.lock().await;
            guard.get_mut().flush().await
        };
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check).await {
            Ok(Ok(())) => {
                tracing::debug!(port = port_path, device, "Reusing shared instrument line");
                return Ok(port);
            }
            Ok(Err(e)) => {
                tracing::warn!(port = port_path, error = %e, "Shared line health check failed, reopening");
                remove_port(port_path);
            }
            Err(_) => {
                // Held by a long transaction; still alive.
                return Ok(port);
            }
        }
    }

    let port = open_port(port_path, settings, device).await?;
    register_port(port_path, port.clone());
    Ok(port)
}

#[cfg(feature = "serial")]
async fn open_port(port_path: &str, settings: &LineSettings, device: &str) -> CryoResult<SharedPort> {
    let stream = cryo_core::serial::open_serial_async(port_path, settings, device).await?;
    tracing::info!(port = port_path, device, baud = settings.baud, "Opened serial line");
    Ok(cryo_core::serial::wrap_shared(Box::new(stream)))
}

#[cfg(not(feature = "serial"))]
async fn open_port(port_path: &str, _settings: &LineSettings, device: &str) -> CryoResult<SharedPort> {
    tracing::error!(port = port_path, device, "Serial support is not compiled in");
    Err(CryoError::FeatureNotEnabled("serial".into()))
}

/// Drops a link's handle and closes the line once only the registry holds it.
pub fn release_port(port_path: &str, port: SharedPort) {
    let mut registry = port_registry().write();
    let last_user = registry
        .get(port_path)
        .map(|registered| Arc::ptr_eq(registered, &port) && Arc::strong_count(&port) <= 2)
        .unwrap_or(false);
    drop(port);
    if last_user {
        registry.remove(port_path);
        tracing::info!(port = port_path, "Closed shared instrument line");
    }
}

/// Closes every registered line.
pub fn close_all_ports() {
    if let Some(registry) = SHARED_PORTS.get() {
        let mut guard = registry.write();
        let count = guard.len();
        guard.clear();
        tracing::info!(count, "Closed all shared instrument lines");
    }
}

/// Number of registered lines.
pub fn port_count() -> usize {
    SHARED_PORTS.get().map(|r| r.read().len()).unwrap_or(0)
}

/// Error for a gateway slave with no master line.
pub(crate) fn missing_master(device: &str, port_path: &str) -> CryoError {
    CryoError::Configuration(format!("{}: no gateway master is open on {}", device, port_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;
    use cryo_core::serial::wrap_shared;

    #[tokio::test]
    #[serial_test::serial]
    async fn test_registered_port_is_reused() {
        close_all_ports();
        let (port, _harness) = mock_serial::new();
        let shared = wrap_shared(Box::new(port));
        register_port("/dev/sim0", shared.clone());

        let reused = get_or_open_port("/dev/sim0", &LineSettings::default(), "ITC503").await.unwrap();
        assert!(Arc::ptr_eq(&reused, &shared));
        assert_eq!(port_count(), 1);
        close_all_ports();
    }

    #[test]
    #[serial_test::serial]
    fn test_release_closes_after_last_user() {
        close_all_ports();
        let (port, _harness) = mock_serial::new();
        let shared = wrap_shared(Box::new(port));
        register_port("/dev/sim1", shared.clone());
        let second = shared.clone();

        release_port("/dev/sim1", shared);
        assert!(get_existing_port("/dev/sim1").is_some());
        release_port("/dev/sim1", second);
        assert!(get_existing_port("/dev/sim1").is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_remove_unknown_port() {
        assert!(!remove_port("/dev/none"));
        let err = missing_master("IPS120", "/dev/none");
        assert!(matches!(err, CryoError::Configuration(_)));
    }
}
