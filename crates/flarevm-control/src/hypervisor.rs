//! HTTP client for the hypervisor host agent.
//!
//! Each host runs an agent that owns the Firecracker processes, tap devices
//! and disk images. The controller drives it through the `Hypervisor` trait;
//! the host agent is the only component that touches Firecracker's socket.

use std::time::Duration;

use async_trait::async_trait;
use flarevm_core::VmId;
use flarevm_store::NetworkIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a hypervisor backend.
#[derive(Debug, Clone, Error)]
pub enum HypervisorError {
    /// The host agent could not be reached.
    #[error("host agent unreachable: {0}")]
    Unavailable(String),

    /// The host agent answered with an error status.
    #[error("host agent returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The host agent has no such VM.
    #[error("VM not found on host")]
    NotFound,

    /// The response body could not be decoded.
    #[error("invalid host agent response: {0}")]
    InvalidResponse(String),

    /// The call did not complete in time.
    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

impl HypervisorError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::NotFound | Self::InvalidResponse(_) | Self::Timeout(_) => false,
        }
    }
}

/// Everything the host agent needs to provision and boot a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// VM being provisioned.
    pub vm_id: VmId,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub memory_size_mib: u32,
    /// Root disk size in GB.
    pub disk_size_gb: u32,
    /// Host path of the guest kernel.
    pub kernel_image_path: String,
    /// Host path of the root filesystem image to clone.
    pub rootfs_path: String,
    /// Guest network identity.
    pub network: NetworkIdentity,
}

impl MachineSpec {
    /// Kernel command line for the guest, carrying its static IP setup.
    #[must_use]
    pub fn boot_args(&self) -> String {
        format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.255.252::eth0:off",
            self.network.ip_address, self.network.tap_ip
        )
    }
}

/// Raw cumulative counters read from a VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCounters {
    /// Total guest CPU time across all vCPUs, microseconds.
    pub cpu_time_us: u64,
    /// Guest memory in use, MiB.
    pub memory_usage_mib: u64,
    /// Bytes received on the VM interface.
    pub network_rx_bytes: u64,
    /// Bytes transmitted on the VM interface.
    pub network_tx_bytes: u64,
    /// Bytes read from the VM disks.
    pub disk_read_bytes: u64,
    /// Bytes written to the VM disks.
    pub disk_write_bytes: u64,
}

/// Trait for hypervisor communication.
///
/// This trait abstracts the host agent interface, allowing for
/// mock implementations in tests.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create the VM's disk, tap device and Firecracker process, then boot it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the host rejects it.
    async fn provision(&self, spec: &MachineSpec) -> Result<(), HypervisorError>;

    /// Boot a stopped VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the host rejects it.
    async fn start(&self, vm_id: &VmId) -> Result<(), HypervisorError>;

    /// Shut a running VM down, keeping its disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the host rejects it.
    async fn stop(&self, vm_id: &VmId) -> Result<(), HypervisorError>;

    /// Pause a running VM's vCPUs.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the host rejects it.
    async fn pause(&self, vm_id: &VmId) -> Result<(), HypervisorError>;

    /// Resume a paused VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the host rejects it.
    async fn resume(&self, vm_id: &VmId) -> Result<(), HypervisorError>;

    /// Tear the VM down and free its disk and tap device.
    ///
    /// Destroying a VM the host doesn't know is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn destroy(&self, vm_id: &VmId) -> Result<(), HypervisorError>;

    /// Read the VM's cumulative counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the VM isn't running.
    async fn read_counters(&self, vm_id: &VmId) -> Result<VmCounters, HypervisorError>;
}

/// HTTP client for the host agent.
///
/// This client makes HTTP requests to the host agent's REST API for
/// managing Firecracker VMs.
#[derive(Debug, Clone)]
pub struct HttpHypervisorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHypervisorClient {
    /// Create a new host agent client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the host agent (e.g., "http://127.0.0.1:8090")
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, HypervisorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| HypervisorError::Unavailable(format!("failed to build client: {e}")))?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create a new host agent client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL of the host agent.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn vm_url(&self, vm_id: &VmId) -> String {
        format!("{}/v1/vms/{vm_id}", self.base_url)
    }

    async fn action(&self, vm_id: &VmId, action_type: &'static str) -> Result<(), HypervisorError> {
        let url = format!("{}/actions", self.vm_url(vm_id));

        let response = self
            .client
            .post(&url)
            .json(&ActionRequest { action_type })
            .send()
            .await
            .map_err(request_failed)?;

        if response.status().is_success() {
            tracing::debug!(vm_id = %vm_id, action_type, "Host agent accepted action");
            Ok(())
        } else {
            Err(error_from_response(vm_id, action_type, response).await)
        }
    }
}

/// Request body for provisioning a VM, mirroring Firecracker's resources.
#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    machine_config: MachineConfig,
    boot_source: BootSource<'a>,
    drives: [Drive<'a>; 1],
    network_interfaces: [NetworkInterface<'a>; 1],
    network_namespace: &'a str,
    tap_ip: String,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u32,
    smt: bool,
}

#[derive(Debug, Serialize)]
struct BootSource<'a> {
    kernel_image_path: &'a str,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive<'a> {
    drive_id: &'static str,
    path_on_host: &'a str,
    size_gb: u32,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface<'a> {
    iface_id: &'static str,
    guest_mac: &'a str,
    host_dev_name: &'a str,
}

impl<'a> From<&'a MachineSpec> for ProvisionRequest<'a> {
    fn from(spec: &'a MachineSpec) -> Self {
        Self {
            machine_config: MachineConfig {
                vcpu_count: spec.vcpu_count,
                mem_size_mib: spec.memory_size_mib,
                smt: false,
            },
            boot_source: BootSource {
                kernel_image_path: &spec.kernel_image_path,
                boot_args: spec.boot_args(),
            },
            drives: [Drive {
                drive_id: "rootfs",
                path_on_host: &spec.rootfs_path,
                size_gb: spec.disk_size_gb,
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: [NetworkInterface {
                iface_id: "eth0",
                guest_mac: &spec.network.mac_address,
                host_dev_name: &spec.network.tap_device_name,
            }],
            network_namespace: &spec.network.network_namespace,
            tap_ip: spec.network.tap_ip.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ActionRequest {
    action_type: &'static str,
}

/// Error response from the host agent.
///
/// Firecracker-style `fault_message` bodies are accepted as well.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "fault_message")]
    error: String,
}

fn request_failed(e: reqwest::Error) -> HypervisorError {
    HypervisorError::Unavailable(format!("request failed: {e}"))
}

async fn error_from_response(
    vm_id: &VmId,
    operation: &'static str,
    response: reqwest::Response,
) -> HypervisorError {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return HypervisorError::NotFound;
    }

    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| format!("host agent returned status {status}"));

    tracing::error!(
        vm_id = %vm_id,
        operation,
        status = %status,
        error = %message,
        "Host agent call failed"
    );

    HypervisorError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl Hypervisor for HttpHypervisorClient {
    async fn provision(&self, spec: &MachineSpec) -> Result<(), HypervisorError> {
        let url = self.vm_url(&spec.vm_id);

        let response = self
            .client
            .put(&url)
            .json(&ProvisionRequest::from(spec))
            .send()
            .await
            .map_err(request_failed)?;

        if response.status().is_success() {
            tracing::debug!(vm_id = %spec.vm_id, "Provisioned VM via host agent");
            Ok(())
        } else {
            Err(error_from_response(&spec.vm_id, "provision", response).await)
        }
    }

    async fn start(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        self.action(vm_id, "InstanceStart").await
    }

    async fn stop(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        self.action(vm_id, "InstanceStop").await
    }

    async fn pause(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        self.action(vm_id, "Pause").await
    }

    async fn resume(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        self.action(vm_id, "Resume").await
    }

    async fn destroy(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        let response = self
            .client
            .delete(self.vm_url(vm_id))
            .send()
            .await
            .map_err(request_failed)?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(vm_id = %vm_id, "Destroyed VM via host agent");
            Ok(())
        } else {
            Err(error_from_response(vm_id, "destroy", response).await)
        }
    }

    async fn read_counters(&self, vm_id: &VmId) -> Result<VmCounters, HypervisorError> {
        let url = format!("{}/metrics", self.vm_url(vm_id));

        let response = self.client.get(&url).send().await.map_err(request_failed)?;

        if response.status().is_success() {
            response
                .json::<VmCounters>()
                .await
                .map_err(|e| HypervisorError::InvalidResponse(e.to_string()))
        } else {
            Err(error_from_response(vm_id, "read_counters", response).await)
        }
    }
}

/// A no-op hypervisor for when no host agent is configured.
///
/// Every call succeeds without touching a VM, which lets the API run
/// end to end on a development machine.
#[derive(Debug, Clone, Default)]
pub struct NoopHypervisor;

impl NoopHypervisor {
    /// Create a new no-op hypervisor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Hypervisor for NoopHypervisor {
    async fn provision(&self, spec: &MachineSpec) -> Result<(), HypervisorError> {
        tracing::warn!(
            vm_id = %spec.vm_id,
            "NoopHypervisor: provision called but no host agent configured"
        );
        Ok(())
    }

    async fn start(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        tracing::warn!(vm_id = %vm_id, "NoopHypervisor: start called but no host agent configured");
        Ok(())
    }

    async fn stop(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        tracing::warn!(vm_id = %vm_id, "NoopHypervisor: stop called but no host agent configured");
        Ok(())
    }

    async fn pause(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        tracing::warn!(vm_id = %vm_id, "NoopHypervisor: pause called but no host agent configured");
        Ok(())
    }

    async fn resume(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        tracing::warn!(
            vm_id = %vm_id,
            "NoopHypervisor: resume called but no host agent configured"
        );
        Ok(())
    }

    async fn destroy(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
        tracing::warn!(
            vm_id = %vm_id,
            "NoopHypervisor: destroy called but no host agent configured"
        );
        Ok(())
    }

    async fn read_counters(&self, _vm_id: &VmId) -> Result<VmCounters, HypervisorError> {
        Ok(VmCounters::default())
    }
}

/// In-memory hypervisor for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::{async_trait, Duration, Hypervisor, HypervisorError, MachineSpec, VmCounters, VmId};

    /// A hypervisor operation, for call recording and failure injection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MockOp {
        /// `provision`
        Provision,
        /// `start`
        Start,
        /// `stop`
        Stop,
        /// `pause`
        Pause,
        /// `resume`
        Resume,
        /// `destroy`
        Destroy,
        /// `read_counters`
        ReadCounters,
    }

    #[derive(Debug, Clone, Copy)]
    struct InjectedFailure {
        remaining: u32,
        transient: bool,
    }

    /// Mock hypervisor that records calls and can be told to fail or stall.
    #[derive(Debug, Default)]
    pub struct MockHypervisor {
        calls: Mutex<Vec<(MockOp, VmId)>>,
        failures: Mutex<HashMap<MockOp, InjectedFailure>>,
        delays: Mutex<HashMap<MockOp, Duration>>,
        counters: Mutex<HashMap<VmId, VmCounters>>,
    }

    impl MockHypervisor {
        /// Create a mock that succeeds immediately.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `times` calls of `op`.
        pub fn fail_next(&self, op: MockOp, times: u32, transient: bool) {
            self.failures.lock().insert(
                op,
                InjectedFailure {
                    remaining: times,
                    transient,
                },
            );
        }

        /// Delay every call of `op` by `delay`.
        pub fn set_delay(&self, op: MockOp, delay: Duration) {
            self.delays.lock().insert(op, delay);
        }

        /// Set the counters `read_counters` reports for a VM.
        pub fn set_counters(&self, vm_id: VmId, counters: VmCounters) {
            self.counters.lock().insert(vm_id, counters);
        }

        /// All recorded calls in order.
        #[must_use]
        pub fn calls(&self) -> Vec<(MockOp, VmId)> {
            self.calls.lock().clone()
        }

        /// Number of recorded calls of `op`.
        #[must_use]
        pub fn call_count(&self, op: MockOp) -> usize {
            self.calls.lock().iter().filter(|(o, _)| *o == op).count()
        }

        async fn call(&self, op: MockOp, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.calls.lock().push((op, *vm_id));

            let delay = self.delays.lock().get(&op).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut failures = self.failures.lock();
            if let Some(failure) = failures.get_mut(&op) {
                if failure.remaining > 0 {
                    failure.remaining -= 1;
                    return Err(if failure.transient {
                        HypervisorError::Unavailable("injected failure".to_string())
                    } else {
                        HypervisorError::Api {
                            status: 400,
                            message: "injected failure".to_string(),
                        }
                    });
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Hypervisor for MockHypervisor {
        async fn provision(&self, spec: &MachineSpec) -> Result<(), HypervisorError> {
            self.call(MockOp::Provision, &spec.vm_id).await
        }

        async fn start(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.call(MockOp::Start, vm_id).await
        }

        async fn stop(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.call(MockOp::Stop, vm_id).await
        }

        async fn pause(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.call(MockOp::Pause, vm_id).await
        }

        async fn resume(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.call(MockOp::Resume, vm_id).await
        }

        async fn destroy(&self, vm_id: &VmId) -> Result<(), HypervisorError> {
            self.counters.lock().remove(vm_id);
            self.call(MockOp::Destroy, vm_id).await
        }

        async fn read_counters(&self, vm_id: &VmId) -> Result<VmCounters, HypervisorError> {
            self.call(MockOp::ReadCounters, vm_id).await?;
            Ok(self.counters.lock().get(vm_id).copied().unwrap_or_default())
        }
    }
}
