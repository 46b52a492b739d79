//! Two-stage drain pipeline: a drain queue and a termination queue on a
//! cloud message bus, plus the worker that shepherds a node through
//! scheduler-side maintenance before cloud-side termination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DrainWorkerConfig;
use crate::core::node::InstanceMetadata;
use crate::draining::mesos::MesosOperatorApi;
use crate::errors::{QueueError, ResourceGroupError, SetupError};
use crate::resource_groups::registry::resource_group_provider;

/// Message attribute carrying the resource-group backend tag.
pub const SENDER_ATTRIBUTE: &str = "Sender";

/// Delay applied to termination messages when the sender has no configured
/// timeout, long enough for scheduler-side draining to finish.
pub const DEFAULT_TERMINATION_DELAY_SECONDS: u64 = 90;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DrainWorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    ResourceGroup(#[from] ResourceGroupError),
}

/// Envelope for a node moving through the pipeline. Only the four body
/// fields travel as JSON; `sender` and `receipt_handle` come from message
/// metadata.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DrainHost {
    pub instance_id: String,
    pub ip: String,
    /// Empty when the host never registered with the cluster scheduler.
    pub hostname: String,
    pub group_id: String,
    #[serde(skip)]
    pub sender: String,
    #[serde(skip)]
    pub receipt_handle: String,
}

impl DrainHost {
    fn hostname_ip(&self) -> String {
        format!("{}|{}", self.hostname, self.ip)
    }
}

/// One message as returned by the queue transport.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub receipt_handle: String,
}

/// Capability over the cloud message bus. At-least-once delivery; a message
/// stays invisible for `delay_seconds` after send and is gone only once
/// deleted by receipt handle.
pub trait QueueClient {
    fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &HashMap<String, String>,
        delay_seconds: u64,
    ) -> Result<(), QueueError>;

    fn receive_message(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;
}

/// Client for the drain and termination queues of one cluster.
pub struct DrainingClient {
    client: Arc<dyn QueueClient>,
    drain_queue_url: String,
    termination_queue_url: String,
    termination_timeouts: HashMap<String, u64>,
    maintenance_timeout_seconds: u64,
}

impl DrainingClient {
    pub fn new(
        cluster: &str,
        config: &DrainWorkerConfig,
        client: Arc<dyn QueueClient>,
    ) -> Result<Self, SetupError> {
        let cluster_config = config
            .mesos_clusters
            .get(cluster)
            .ok_or_else(|| SetupError::UnknownCluster(cluster.to_string()))?;
        Ok(Self {
            client,
            drain_queue_url: cluster_config.drain_queue_url.clone(),
            termination_queue_url: cluster_config.termination_queue_url.clone(),
            termination_timeouts: config.drain_termination_timeout_seconds.clone(),
            maintenance_timeout_seconds: config.mesos_maintenance_timeout_seconds,
        })
    }

    /// Enqueue an instance for draining. `sender` is the backend tag of the
    /// group the instance belongs to.
    pub fn submit_instance_for_draining(
        &self,
        instance: &InstanceMetadata,
        sender: &str,
    ) -> Result<(), QueueError> {
        let host = DrainHost {
            instance_id: instance.instance_id.clone(),
            ip: instance.ip_address.clone().unwrap_or_default(),
            hostname: instance.hostname.clone().unwrap_or_default(),
            group_id: instance.group_id.clone(),
            sender: sender.to_string(),
            receipt_handle: String::new(),
        };
        self.client.send_message(
            &self.drain_queue_url,
            &encode_host(&host)?,
            &sender_attributes(sender),
            0,
        )
    }

    /// Enqueue a host for termination. Without an explicit `delay`, the
    /// per-sender timeout (default 90s) keeps the message invisible until
    /// scheduler-side draining has had time to finish.
    pub fn submit_host_for_termination(
        &self,
        host: &DrainHost,
        delay: Option<u64>,
    ) -> Result<(), QueueError> {
        let delay_seconds = delay.unwrap_or_else(|| {
            self.termination_timeouts
                .get(&host.sender)
                .copied()
                .unwrap_or(DEFAULT_TERMINATION_DELAY_SECONDS)
        });
        info!(
            "Delaying terminating {} for {} seconds",
            host.instance_id, delay_seconds
        );
        self.client.send_message(
            &self.termination_queue_url,
            &encode_host(host)?,
            &sender_attributes(&host.sender),
            delay_seconds,
        )
    }

    pub fn get_host_to_drain(&self) -> Result<Option<DrainHost>, QueueError> {
        self.receive_host(&self.drain_queue_url)
    }

    pub fn get_host_to_terminate(&self) -> Result<Option<DrainHost>, QueueError> {
        self.receive_host(&self.termination_queue_url)
    }

    pub fn delete_drain_messages(&self, hosts: &[DrainHost]) -> Result<(), QueueError> {
        for host in hosts {
            self.client
                .delete_message(&self.drain_queue_url, &host.receipt_handle)?;
        }
        Ok(())
    }

    pub fn delete_terminate_messages(&self, hosts: &[DrainHost]) -> Result<(), QueueError> {
        for host in hosts {
            self.client
                .delete_message(&self.termination_queue_url, &host.receipt_handle)?;
        }
        Ok(())
    }

    /// Handle at most one drain message: start scheduler-side maintenance
    /// for the host, then hand it to the termination queue. Hosts that never
    /// registered with the scheduler skip maintenance and are submitted with
    /// no delay.
    pub fn process_drain_queue(
        &self,
        operator: &dyn MesosOperatorApi,
    ) -> Result<(), DrainWorkerError> {
        let host = match self.get_host_to_drain()? {
            Some(host) => host,
            None => return Ok(()),
        };

        if host.hostname.is_empty() {
            info!("Host to submit for termination immediately: {:?}", host);
            self.submit_host_for_termination(&host, Some(0))?;
        } else {
            info!("Host to drain and submit for termination: {:?}", host);
            if let Err(e) = operator.drain(
                &[host.hostname_ip()],
                epoch_now_seconds() * 1_000_000_000,
                self.maintenance_timeout_seconds * 1_000_000_000,
            ) {
                error!(
                    "Failed to drain {} continuing to terminate anyway: {}",
                    host.hostname, e
                );
            }
            self.submit_host_for_termination(&host, None)?;
        }
        self.delete_drain_messages(std::slice::from_ref(&host))?;
        Ok(())
    }

    /// Handle at most one termination message: bracket the cloud-side
    /// termination with down/up so the scheduler marks the host out of
    /// service while it disappears.
    pub fn process_termination_queue(
        &self,
        operator: &dyn MesosOperatorApi,
    ) -> Result<(), DrainWorkerError> {
        let host = match self.get_host_to_terminate()? {
            Some(host) => host,
            None => return Ok(()),
        };

        if !host.hostname.is_empty() {
            info!("Host to down+terminate+up: {:?}", host);
            let hostname_ip = host.hostname_ip();
            if let Err(e) = operator.down(std::slice::from_ref(&hostname_ip)) {
                error!(
                    "Failed to down {} continuing to terminate anyway: {}",
                    hostname_ip, e
                );
            }
            terminate_host(&host)?;
            if let Err(e) = operator.up(std::slice::from_ref(&hostname_ip)) {
                error!(
                    "Failed to up {} continuing to terminate anyway: {}",
                    hostname_ip, e
                );
            }
        } else {
            info!("Host to terminate: {:?}", host);
            terminate_host(&host)?;
        }
        self.delete_terminate_messages(std::slice::from_ref(&host))?;
        Ok(())
    }

    fn receive_host(&self, queue_url: &str) -> Result<Option<DrainHost>, QueueError> {
        let messages = self
            .client
            .receive_message(queue_url, &[SENDER_ATTRIBUTE], 1)?;
        let message = match messages.into_iter().next() {
            Some(message) => message,
            None => return Ok(None),
        };
        let mut host: DrainHost = serde_json::from_str(&message.body)
            .map_err(|e| QueueError(format!("undecodable message body: {}", e)))?;
        host.sender = message
            .attributes
            .get(SENDER_ATTRIBUTE)
            .cloned()
            .unwrap_or_default();
        host.receipt_handle = message.receipt_handle;
        Ok(Some(host))
    }
}

/// Terminate a host's instance through the backend named by its sender tag.
pub fn terminate_host(host: &DrainHost) -> Result<(), ResourceGroupError> {
    info!("Terminating: {}", host.instance_id);
    let provider = resource_group_provider(&host.sender)
        .ok_or_else(|| ResourceGroupError::UnknownGroupType(host.sender.clone()))?;
    let mut group = provider.attach(&host.group_id)?;
    group.terminate_instances_by_id(std::slice::from_ref(&host.instance_id))?;
    Ok(())
}

/// Poll both queues forever, draining first so maintenance has started by
/// the time the delayed termination message becomes visible.
pub fn process_queues(
    draining_client: &DrainingClient,
    operator: &dyn MesosOperatorApi,
) -> Result<(), DrainWorkerError> {
    info!("Polling queues for messages every {:?}", POLL_INTERVAL);
    loop {
        draining_client.process_drain_queue(operator)?;
        draining_client.process_termination_queue(operator)?;
        thread::sleep(POLL_INTERVAL);
    }
}

fn encode_host(host: &DrainHost) -> Result<String, QueueError> {
    serde_json::to_string(host).map_err(|e| QueueError(format!("unencodable message: {}", e)))
}

fn sender_attributes(sender: &str) -> HashMap<String, String> {
    HashMap::from([(SENDER_ATTRIBUTE.to_string(), sender.to_string())])
}

fn epoch_now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

struct StoredMessage {
    body: String,
    attributes: HashMap<String, String>,
    visible_at: u64,
}

#[derive(Default)]
struct InMemoryQueueState {
    now_seconds: u64,
    next_receipt: u64,
    queues: HashMap<String, Vec<StoredMessage>>,
    in_flight: HashMap<String, StoredMessage>,
}

/// Queue transport backed by process memory, with a logical clock honoring
/// send delays. The development and test backend; cloud transports live
/// outside this crate.
#[derive(Default)]
pub struct InMemoryQueueClient {
    state: Mutex<InMemoryQueueState>,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the logical clock, making delayed messages visible.
    pub fn advance_time(&self, seconds: u64) {
        self.state.lock().expect("queue state poisoned").now_seconds += seconds;
    }

    /// Number of messages sitting in `queue_url`, visible or not.
    pub fn message_count(&self, queue_url: &str) -> usize {
        self.state
            .lock()
            .expect("queue state poisoned")
            .queues
            .get(queue_url)
            .map_or(0, |messages| messages.len())
    }
}

impl QueueClient for InMemoryQueueClient {
    fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &HashMap<String, String>,
        delay_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let visible_at = state.now_seconds + delay_seconds;
        state
            .queues
            .entry(queue_url.to_string())
            .or_default()
            .push(StoredMessage {
                body: body.to_string(),
                attributes: attributes.clone(),
                visible_at,
            });
        Ok(())
    }

    fn receive_message(
        &self,
        queue_url: &str,
        _attribute_names: &[&str],
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let now = state.now_seconds;
        let mut received = Vec::new();
        while received.len() < max_messages {
            let index = match state
                .queues
                .get(queue_url)
                .and_then(|messages| messages.iter().position(|m| m.visible_at <= now))
            {
                Some(index) => index,
                None => break,
            };
            let message = state
                .queues
                .get_mut(queue_url)
                .expect("queue just indexed")
                .remove(index);
            state.next_receipt += 1;
            let receipt_handle = format!("receipt-{}", state.next_receipt);
            received.push(QueueMessage {
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                receipt_handle: receipt_handle.clone(),
            });
            state.in_flight.insert(receipt_handle, message);
        }
        Ok(received)
    }

    fn delete_message(&self, _queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.in_flight.remove(receipt_handle).is_none() {
            warn!("Deleting unknown receipt handle {}", receipt_handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_host_round_trip() {
        let host = DrainHost {
            instance_id: "i-123".to_string(),
            ip: "10.1.1.1".to_string(),
            hostname: "host123".to_string(),
            group_id: "sfr-123".to_string(),
            sender: "sfr".to_string(),
            receipt_handle: "receipt-1".to_string(),
        };
        let body = encode_host(&host).unwrap();
        // Metadata fields never hit the wire.
        assert!(!body.contains("sender"));
        assert!(!body.contains("receipt_handle"));
        let decoded: DrainHost = serde_json::from_str(&body).unwrap();
        assert_eq!(host.instance_id, decoded.instance_id);
        assert_eq!(host.ip, decoded.ip);
        assert_eq!(host.hostname, decoded.hostname);
        assert_eq!(host.group_id, decoded.group_id);
        assert!(decoded.sender.is_empty());
        assert!(decoded.receipt_handle.is_empty());
    }

    #[test]
    fn test_in_memory_queue_delay_visibility() {
        let client = InMemoryQueueClient::new();
        client
            .send_message("q", "body", &HashMap::new(), 90)
            .unwrap();
        assert!(client
            .receive_message("q", &[SENDER_ATTRIBUTE], 1)
            .unwrap()
            .is_empty());

        client.advance_time(90);
        let messages = client.receive_message("q", &[SENDER_ATTRIBUTE], 1).unwrap();
        assert_eq!(1, messages.len());
        assert_eq!("body", messages[0].body);

        // Received messages are in flight until deleted.
        assert!(client
            .receive_message("q", &[SENDER_ATTRIBUTE], 1)
            .unwrap()
            .is_empty());
        client
            .delete_message("q", &messages[0].receipt_handle)
            .unwrap();
    }
}
