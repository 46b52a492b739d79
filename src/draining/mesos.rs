//! Operator API capability used to quiesce nodes in the cluster scheduler
//! around cloud-side termination.

use log::info;

use crate::errors::OperatorError;

/// Maintenance RPCs against the cluster operator endpoint. Host entries are
/// `"hostname|ip"` pairs.
pub trait MesosOperatorApi {
    /// Start draining tasks off the given hosts. `start_ns` is an epoch
    /// timestamp and `duration_ns` bounds the maintenance window, both in
    /// nanoseconds.
    fn drain(&self, hosts: &[String], start_ns: u64, duration_ns: u64)
        -> Result<(), OperatorError>;

    /// Mark the hosts as down (out of service) in the scheduler.
    fn down(&self, hosts: &[String]) -> Result<(), OperatorError>;

    /// Return the hosts to service.
    fn up(&self, hosts: &[String]) -> Result<(), OperatorError>;
}

/// Operator client that only logs its calls. Stands in for a real transport
/// in development and dry runs.
pub struct LoggingOperatorApi {
    fqdn: String,
}

impl LoggingOperatorApi {
    pub fn new(fqdn: &str) -> Self {
        Self {
            fqdn: fqdn.to_string(),
        }
    }
}

impl MesosOperatorApi for LoggingOperatorApi {
    fn drain(
        &self,
        hosts: &[String],
        start_ns: u64,
        duration_ns: u64,
    ) -> Result<(), OperatorError> {
        info!(
            "drain on {}: hosts={:?} start={}ns duration={}ns",
            self.fqdn, hosts, start_ns, duration_ns
        );
        Ok(())
    }

    fn down(&self, hosts: &[String]) -> Result<(), OperatorError> {
        info!("down on {}: hosts={:?}", self.fqdn, hosts);
        Ok(())
    }

    fn up(&self, hosts: &[String]) -> Result<(), OperatorError> {
        info!("up on {}: hosts={:?}", self.fqdn, hosts);
        Ok(())
    }
}
