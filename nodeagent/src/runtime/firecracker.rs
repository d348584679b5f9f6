//! Firecracker backend: one microVM per instance.
//!
//! Each instance gets a directory under the agent's data dir holding its
//! machine config, console log, API socket and metadata. Addressing carves a
//! /29 chunk out of the server range around the instance's address: the tap
//! device takes `.1` of the chunk and the guest `.2`, so the guest address is
//! what gets written back to the database.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use hyper::{Body, Request};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    InstanceSpec, InstanceState, LogLines, Runtime, RuntimeError, RuntimeInstance,
};

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Host-side metadata persisted next to each microVM so that `list` survives
/// agent restarts.
#[derive(Debug, Serialize, Deserialize)]
struct InstanceMeta {
    instance_id: Uuid,
    image: String,
    ip: IpAddr,
    pid: u32,
}

pub struct FirecrackerRuntime {
    firecracker_bin: PathBuf,
    jailer_bin: Option<PathBuf>,
    kernel_path: PathBuf,
    rootfs_dir: PathBuf,
    data_dir: PathBuf,
    children: Mutex<HashMap<Uuid, Child>>,
}

/// The `.1` (tap) and `.2` (guest) addresses of the /29 chunk containing
/// `ip`.
pub fn chunk_addresses(ip: IpAddr) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let IpAddr::V4(ip) = ip else {
        return None;
    };
    let base = u32::from(ip) & !0x7;
    Some((Ipv4Addr::from(base + 1), Ipv4Addr::from(base + 2)))
}

/// Interface names are capped at 15 bytes; 10 hex chars of the id keep them
/// unique enough per host.
pub fn tap_name(instance_id: Uuid) -> String {
    let hex = instance_id.simple().to_string();
    format!("zwtap{}", &hex[..10])
}

impl FirecrackerRuntime {
    pub fn new(
        firecracker_bin: PathBuf,
        jailer_bin: Option<PathBuf>,
        kernel_path: PathBuf,
        rootfs_dir: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            firecracker_bin,
            jailer_bin,
            kernel_path,
            rootfs_dir,
            data_dir,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn instance_dir(&self, instance_id: Uuid) -> PathBuf {
        self.data_dir.join("instances").join(instance_id.to_string())
    }

    /// Root of the jailer chroot for an instance:
    /// `{base}/{exec-file-name}/{id}/root`, mirroring the jailer's own layout.
    fn chroot_root(&self, instance_id: Uuid) -> PathBuf {
        let exec_name = self
            .firecracker_bin
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firecracker".to_string());
        self.instance_dir(instance_id)
            .join("jail")
            .join(exec_name)
            .join(instance_id.to_string())
            .join("root")
    }

    fn socket_path(&self, instance_id: Uuid) -> PathBuf {
        if self.jailer_bin.is_some() {
            self.chroot_root(instance_id)
                .join("run")
                .join("firecracker.socket")
        } else {
            self.instance_dir(instance_id).join("firecracker.sock")
        }
    }

    fn console_path(&self, instance_id: Uuid) -> PathBuf {
        self.instance_dir(instance_id).join("console.log")
    }

    fn meta_path(&self, instance_id: Uuid) -> PathBuf {
        self.instance_dir(instance_id).join("instance.json")
    }

    async fn read_meta(&self, instance_id: Uuid) -> Option<InstanceMeta> {
        let raw = tokio::fs::read(self.meta_path(instance_id)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn render_config(
        &self,
        spec: &InstanceSpec,
        tap: &str,
        tap_ip: Ipv4Addr,
        guest_ip: Ipv4Addr,
        kernel: &Path,
        rootfs: &Path,
    ) -> serde_json::Value {
        // Classic kernel ip= auto-configuration; /29 netmask.
        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off \
             ip={guest_ip}::{tap_ip}:255.255.255.248::eth0:off"
        );

        serde_json::json!({
            "boot-source": {
                "kernel_image_path": kernel,
                "boot_args": boot_args,
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": spec.vcpus,
                "mem_size_mib": spec.memory_mb,
            },
            "network-interfaces": [{
                "iface_id": "eth0",
                "host_dev_name": tap,
            }],
        })
    }

    async fn run_ip(&self, args: &[&str]) -> Result<(), RuntimeError> {
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            return Err(RuntimeError::Rejected(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn create_tap(&self, tap: &str, tap_ip: Ipv4Addr) -> Result<(), RuntimeError> {
        // A leftover device from a crashed attempt is replaced.
        let _ = self.run_ip(&["link", "del", tap]).await;
        self.run_ip(&["tuntap", "add", tap, "mode", "tap"]).await?;
        self.run_ip(&["addr", "add", &format!("{tap_ip}/29"), "dev", tap])
            .await?;
        self.run_ip(&["link", "set", tap, "up"]).await?;
        Ok(())
    }

    async fn delete_tap(&self, tap: &str) {
        if let Err(error) = self.run_ip(&["link", "del", tap]).await {
            debug!(tap, %error, "tap removal failed (may already be gone)");
        }
    }

    /// One request against the microVM's API socket.
    async fn api_put(
        &self,
        instance_id: Uuid,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        let stream = UnixStream::connect(self.socket_path(instance_id)).await?;
        let (mut sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method("PUT")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Rejected(format!(
                "firecracker api returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn pid_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    async fn spawn_vmm(
        &self,
        instance_id: Uuid,
        dir: &Path,
        config_path: &Path,
    ) -> Result<Child, RuntimeError> {
        let console = std::fs::File::create(self.console_path(instance_id))?;
        let console_err = console.try_clone()?;

        let mut command = match &self.jailer_bin {
            Some(jailer) => {
                // The jailer chdirs into the chroot root; the VMM sees only
                // chroot-relative paths.
                let mut command = Command::new(jailer);
                command
                    .arg("--id")
                    .arg(instance_id.to_string())
                    .arg("--exec-file")
                    .arg(&self.firecracker_bin)
                    .arg("--uid")
                    .arg("0")
                    .arg("--gid")
                    .arg("0")
                    .arg("--chroot-base-dir")
                    .arg(dir.join("jail"))
                    .arg("--")
                    .arg("--config-file")
                    .arg("config.json")
                    .arg("--api-sock")
                    .arg("/run/firecracker.socket");
                command
            }
            None => {
                let mut command = Command::new(&self.firecracker_bin);
                command
                    .arg("--api-sock")
                    .arg(self.socket_path(instance_id))
                    .arg("--config-file")
                    .arg(config_path);
                command
            }
        };

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::from(console))
            .stderr(Stdio::from(console_err))
            .spawn()?;

        Ok(child)
    }
}

#[async_trait]
impl Runtime for FirecrackerRuntime {
    async fn start(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        if let Some(existing) = self.status(spec.id).await? {
            if existing.state == InstanceState::Running {
                debug!(instance = %spec.id, "microvm already running");
                return Ok(());
            }
        }

        let requested_ip = spec.ip.ok_or(RuntimeError::InvalidSpec("ip"))?;
        let (tap_ip, guest_ip) =
            chunk_addresses(requested_ip).ok_or(RuntimeError::InvalidSpec("ipv4 address"))?;
        let disk_image_key = spec
            .disk_image_key
            .as_deref()
            .ok_or(RuntimeError::InvalidSpec("disk image"))?;

        let dir = self.instance_dir(spec.id);
        tokio::fs::create_dir_all(&dir).await?;

        // Stage the boot files where the VMM will find them: next to the
        // socket when unjailed, inside the chroot (with chroot-relative
        // paths in the config) when jailed.
        let jailed = self.jailer_bin.is_some();
        let stage_dir = if jailed {
            self.chroot_root(spec.id)
        } else {
            dir.clone()
        };
        tokio::fs::create_dir_all(&stage_dir).await?;

        // Per-VM writable copy of the prebuilt root filesystem.
        tokio::fs::copy(
            self.rootfs_dir.join(disk_image_key),
            stage_dir.join("rootfs.ext4"),
        )
        .await?;

        let (kernel_ref, rootfs_ref) = if jailed {
            tokio::fs::copy(&self.kernel_path, stage_dir.join("vmlinux")).await?;
            (PathBuf::from("vmlinux"), PathBuf::from("rootfs.ext4"))
        } else {
            (self.kernel_path.clone(), stage_dir.join("rootfs.ext4"))
        };

        let tap = tap_name(spec.id);
        self.create_tap(&tap, tap_ip).await?;

        let config = self.render_config(spec, &tap, tap_ip, guest_ip, &kernel_ref, &rootfs_ref);
        let config_path = stage_dir.join("config.json");
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?).await?;

        let child = match self.spawn_vmm(spec.id, &dir, &config_path).await {
            Ok(child) => child,
            Err(error) => {
                self.delete_tap(&tap).await;
                return Err(error);
            }
        };

        // A VMM that dies immediately (bad kernel, bad rootfs) should fail
        // the start rather than show up as running for one cycle.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pid = child.id().ok_or_else(|| {
            RuntimeError::Rejected("vmm exited during startup, see console log".into())
        })?;

        let meta = InstanceMeta {
            instance_id: spec.id,
            image: spec.image.clone(),
            ip: IpAddr::V4(guest_ip),
            pid,
        };
        tokio::fs::write(self.meta_path(spec.id), serde_json::to_vec(&meta)?).await?;

        self.children.lock().await.insert(spec.id, child);

        info!(instance = %spec.id, ip = %guest_ip, tap, "microvm started");
        Ok(())
    }

    async fn stop(&self, instance_id: Uuid) -> Result<(), RuntimeError> {
        let Some(meta) = self.read_meta(instance_id).await else {
            debug!(instance = %instance_id, "microvm already gone");
            return Ok(());
        };

        // Ask the guest to power down, then escalate.
        if Self::pid_alive(meta.pid) {
            if let Err(error) = self
                .api_put(
                    instance_id,
                    "/actions",
                    serde_json::json!({ "action_type": "SendCtrlAltDel" }),
                )
                .await
            {
                debug!(instance = %instance_id, %error, "graceful shutdown request failed");
            }

            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            while Self::pid_alive(meta.pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        if let Some(mut child) = self.children.lock().await.remove(&instance_id) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        } else if Self::pid_alive(meta.pid) {
            // Orphan from a previous agent process.
            let _ = Command::new("kill")
                .arg("-9")
                .arg(meta.pid.to_string())
                .output()
                .await;
        }

        self.delete_tap(&tap_name(instance_id)).await;
        if let Err(error) = tokio::fs::remove_dir_all(self.instance_dir(instance_id)).await {
            warn!(
                instance = %instance_id,
                error = &error as &dyn std::error::Error,
                "could not remove instance directory"
            );
        }

        info!(instance = %instance_id, "microvm stopped");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        // Reap finished children so pid liveness below tells the truth.
        {
            let mut children = self.children.lock().await;
            for child in children.values_mut() {
                let _ = child.try_wait();
            }
        }

        let instances_dir = self.data_dir.join("instances");
        let mut instances = Vec::new();

        let mut entries = match tokio::fs::read_dir(&instances_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(instances),
            Err(error) => return Err(error.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(instance_id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            let Some(meta) = self.read_meta(instance_id).await else {
                continue;
            };

            let state = if Self::pid_alive(meta.pid) {
                InstanceState::Running
            } else {
                InstanceState::Exited
            };

            instances.push(RuntimeInstance {
                runtime_id: meta.pid.to_string(),
                instance_id,
                image: meta.image,
                state,
                ip: Some(meta.ip),
            });
        }

        Ok(instances)
    }

    async fn status(&self, instance_id: Uuid) -> Result<Option<RuntimeInstance>, RuntimeError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|instance| instance.instance_id == instance_id))
    }

    async fn logs(&self, instance_id: Uuid, follow: bool) -> Result<LogLines, RuntimeError> {
        let file = tokio::fs::File::open(self.console_path(instance_id)).await?;
        let reader = BufReader::new(file);

        let lines = stream::unfold((reader, follow), |(mut reader, follow)| async move {
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        if !follow {
                            return None;
                        }
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Ok(_) => {
                        let line = line.trim_end_matches('\n').to_string();
                        if line.is_empty() {
                            continue;
                        }
                        return Some((Ok(line), (reader, follow)));
                    }
                    Err(error) => return Some((Err(error), (reader, follow))),
                }
            }
        });

        Ok(Box::pin(lines))
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        // Running microVMs belong to the host and survive agent restarts;
        // only the child handles are dropped here.
        self.children.lock().await.clear();
        Ok(())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(error: serde_json::Error) -> Self {
        RuntimeError::Rejected(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn chunk_tap_and_guest_addresses() {
        let (tap, guest) = chunk_addresses("10.1.0.18".parse().unwrap()).unwrap();
        // containing /29 is 10.1.0.16/29
        assert_eq!(tap, "10.1.0.17".parse::<Ipv4Addr>().unwrap());
        assert_eq!(guest, "10.1.0.18".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn chunk_is_aligned_for_any_member_address() {
        for last in 16..24u32 {
            let ip: IpAddr = format!("10.1.0.{last}").parse().unwrap();
            let (tap, guest) = chunk_addresses(ip).unwrap();
            assert_eq!(tap, "10.1.0.17".parse::<Ipv4Addr>().unwrap());
            assert_eq!(guest, "10.1.0.18".parse::<Ipv4Addr>().unwrap());
        }
    }

    #[test]
    fn ipv6_has_no_chunk() {
        assert_eq!(chunk_addresses("fd00::1".parse().unwrap()), None);
    }

    #[test]
    fn tap_names_fit_in_ifnamsiz() {
        let name = tap_name(Uuid::from_u128(0xdead_beef_cafe_babe_dead_beef_cafe_babe));
        assert!(name.len() <= 15);
        assert!(name.starts_with("zwtap"));
    }

    #[test]
    fn config_includes_network_and_resources() {
        let runtime = FirecrackerRuntime::new(
            "firecracker".into(),
            None,
            "/var/lib/zeitwork/vmlinux".into(),
            "/var/lib/zeitwork/rootfs".into(),
            "/run/zeitwork".into(),
        );

        let spec = InstanceSpec {
            id: Uuid::from_u128(1),
            image: "registry/app:tag".into(),
            disk_image_key: Some("app.ext4".into()),
            ip: Some("10.1.0.18".parse().unwrap()),
            vcpus: 2,
            memory_mb: 1024,
            port: 8080,
            env: Default::default(),
        };

        let config = runtime.render_config(
            &spec,
            "zwtap0",
            "10.1.0.17".parse().unwrap(),
            "10.1.0.18".parse().unwrap(),
            Path::new("/var/lib/zeitwork/vmlinux"),
            Path::new("/run/zeitwork/instances/x/rootfs.ext4"),
        );

        assert_eq!(config["machine-config"]["vcpu_count"], 2);
        assert_eq!(config["machine-config"]["mem_size_mib"], 1024);
        assert_eq!(config["network-interfaces"][0]["host_dev_name"], "zwtap0");
        let boot_args = config["boot-source"]["boot_args"].as_str().unwrap();
        assert!(boot_args.contains("ip=10.1.0.18::10.1.0.17:255.255.255.248::eth0:off"));
    }
}
