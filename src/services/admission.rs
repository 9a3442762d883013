use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::process::Command;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub id: String,
    pub free_mib: f64,
}

#[async_trait::async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Accelerator inventory with free memory per device.
    async fn gpu_devices(&self) -> anyhow::Result<Vec<GpuDevice>>;
    /// Available host memory in bytes, `None` when the platform has no way to tell.
    async fn available_memory_bytes(&self) -> anyhow::Result<Option<u64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    pub ok: bool,
    pub available_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub ok: bool,
    pub vram_ok: bool,
    pub vram_gb: f64,
    pub ram_ok: bool,
    pub ram_gb: f64,
    pub min_vram_gb: f64,
    pub min_ram_gb: f64,
}

/// Gate consulted right before a training process is launched.
#[derive(Clone)]
pub struct AdmissionController {
    probe: Arc<dyn ResourceProbe>,
}

impl AdmissionController {
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self { probe }
    }

    /// Picks the device with the most free memory. No device or a probe error denies.
    pub async fn check_gpu_memory(&self, min_gb: f64) -> ProbeReading {
        let devices = match self.probe.gpu_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "admission: failed to check GPU memory");
                return ProbeReading {
                    ok: false,
                    available_gb: 0.0,
                };
            }
        };

        let Some(best) = devices
            .iter()
            .max_by(|a, b| a.free_mib.total_cmp(&b.free_mib))
        else {
            tracing::warn!("admission: no GPU detected");
            return ProbeReading {
                ok: false,
                available_gb: 0.0,
            };
        };

        let available_gb = best.free_mib / 1024.0;
        let ok = available_gb >= min_gb;
        tracing::info!(
            gpu = %best.id,
            free_gb = available_gb,
            required_gb = min_gb,
            ok,
            "admission: GPU memory"
        );
        ProbeReading { ok, available_gb }
    }

    /// Admits when host memory cannot be introspected at all; denies on read errors.
    pub async fn check_system_memory(&self, min_gb: f64) -> ProbeReading {
        match self.probe.available_memory_bytes().await {
            Ok(Some(bytes)) => {
                let available_gb = bytes as f64 / BYTES_PER_GB;
                let ok = available_gb >= min_gb;
                tracing::info!(
                    free_gb = available_gb,
                    required_gb = min_gb,
                    ok,
                    "admission: system RAM"
                );
                ProbeReading { ok, available_gb }
            }
            Ok(None) => {
                tracing::warn!("admission: memory introspection unavailable, skipping RAM check");
                ProbeReading {
                    ok: true,
                    available_gb: 0.0,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "admission: failed to check system memory");
                ProbeReading {
                    ok: false,
                    available_gb: 0.0,
                }
            }
        }
    }

    pub async fn check_resources(&self, min_vram_gb: f64, min_ram_gb: f64) -> ResourceReport {
        let vram = self.check_gpu_memory(min_vram_gb).await;
        let ram = self.check_system_memory(min_ram_gb).await;
        ResourceReport {
            ok: vram.ok && ram.ok,
            vram_ok: vram.ok,
            vram_gb: vram.available_gb,
            ram_ok: ram.ok,
            ram_gb: ram.available_gb,
            min_vram_gb,
            min_ram_gb,
        }
    }
}

/// Probes the local machine through `nvidia-smi` and `/proc/meminfo`.
pub struct SystemProbe;

fn parse_nvidia_smi(output: &str) -> anyhow::Result<Vec<GpuDevice>> {
    let mut devices = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let (Some(id), Some(free)) = (fields.next(), fields.next()) else {
            anyhow::bail!("unexpected nvidia-smi line: {line}");
        };
        let free_mib: f64 = free
            .parse()
            .map_err(|e| anyhow::anyhow!("bad free memory `{free}`: {e}"))?;
        devices.push(GpuDevice {
            id: id.to_string(),
            free_mib,
        });
    }
    Ok(devices)
}

fn parse_meminfo(contents: &str) -> anyhow::Result<u64> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .ok_or_else(|| anyhow::anyhow!("MemAvailable missing from meminfo"))?;
    let kib: u64 = line
        .trim_start_matches("MemAvailable:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()?;
    Ok(kib * 1024)
}

#[async_trait::async_trait]
impl ResourceProbe for SystemProbe {
    async fn gpu_devices(&self) -> anyhow::Result<Vec<GpuDevice>> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }

    async fn available_memory_bytes(&self) -> anyhow::Result<Option<u64>> {
        match tokio::fs::read_to_string(MEMINFO_PATH).await {
            Ok(contents) => parse_meminfo(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Probe returning fixed readings.
    pub(crate) struct FixedProbe {
        pub gpus: Option<Vec<GpuDevice>>,
        pub ram_bytes: Result<Option<u64>, String>,
    }

    impl FixedProbe {
        pub(crate) fn plenty() -> Self {
            Self::new(24.0, 64.0)
        }

        pub(crate) fn new(vram_gb: f64, ram_gb: f64) -> Self {
            Self {
                gpus: Some(vec![GpuDevice {
                    id: "0".into(),
                    free_mib: vram_gb * 1024.0,
                }]),
                ram_bytes: Ok(Some((ram_gb * BYTES_PER_GB) as u64)),
            }
        }
    }

    #[async_trait::async_trait]
    impl ResourceProbe for FixedProbe {
        async fn gpu_devices(&self) -> anyhow::Result<Vec<GpuDevice>> {
            self.gpus
                .clone()
                .ok_or_else(|| anyhow::anyhow!("driver not loaded"))
        }

        async fn available_memory_bytes(&self) -> anyhow::Result<Option<u64>> {
            self.ram_bytes.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn controller(probe: FixedProbe) -> AdmissionController {
        AdmissionController::new(Arc::new(probe))
    }

    #[tokio::test]
    async fn picks_gpu_with_most_free_memory() {
        let probe = FixedProbe {
            gpus: Some(vec![
                GpuDevice {
                    id: "0".into(),
                    free_mib: 2048.0,
                },
                GpuDevice {
                    id: "1".into(),
                    free_mib: 12288.0,
                },
            ]),
            ram_bytes: Ok(None),
        };
        let reading = controller(probe).check_gpu_memory(10.0).await;
        assert!(reading.ok);
        assert_eq!(reading.available_gb, 12.0);
    }

    #[tokio::test]
    async fn gpu_check_fails_closed() {
        let no_devices = FixedProbe {
            gpus: Some(vec![]),
            ram_bytes: Ok(None),
        };
        let reading = controller(no_devices).check_gpu_memory(0.0).await;
        assert_eq!(
            reading,
            ProbeReading {
                ok: false,
                available_gb: 0.0
            }
        );

        let broken = FixedProbe {
            gpus: None,
            ram_bytes: Ok(None),
        };
        assert!(!controller(broken).check_gpu_memory(0.0).await.ok);
    }

    #[tokio::test]
    async fn ram_check_fails_open_only_when_unavailable() {
        let unavailable = FixedProbe {
            gpus: None,
            ram_bytes: Ok(None),
        };
        let reading = controller(unavailable).check_system_memory(4.0).await;
        assert!(reading.ok);
        assert_eq!(reading.available_gb, 0.0);

        let broken = FixedProbe {
            gpus: None,
            ram_bytes: Err("permission denied".into()),
        };
        assert!(!controller(broken).check_system_memory(4.0).await.ok);
    }

    #[tokio::test]
    async fn resources_require_both_checks() {
        let cases = [
            (24.0, 64.0, true),
            (8.0, 64.0, false),
            (24.0, 2.0, false),
            (8.0, 2.0, false),
        ];
        for (vram, ram, expected) in cases {
            let report = controller(FixedProbe::new(vram, ram))
                .check_resources(10.0, 4.0)
                .await;
            assert_eq!(report.ok, expected, "vram={vram} ram={ram}");
            assert_eq!(report.ok, report.vram_ok && report.ram_ok);
            assert_eq!(report.min_vram_gb, 10.0);
        }
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        let devices = parse_nvidia_smi("0, 10240\n1, 512\n\n").unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "0");
        assert_eq!(devices[0].free_mib, 10240.0);
        assert!(parse_nvidia_smi("garbage").is_err());
    }

    #[test]
    fn parses_meminfo_available() {
        let meminfo = "MemTotal:       32000000 kB\nMemFree:         1000000 kB\nMemAvailable:    8388608 kB\n";
        assert_eq!(parse_meminfo(meminfo).unwrap(), 8 * 1024 * 1024 * 1024);
        assert!(parse_meminfo("MemTotal: 1 kB").is_err());
    }
}
