use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// GPUs visible to this process. VRAM is given in MiB.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub gpu_found: bool,
    pub num_gpus: usize,
    pub first_gpu_vram: u64,
    pub total_vram: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GpuInfo {
    fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn from_memory_totals(totals: &[u64]) -> Self {
        Self {
            gpu_found: !totals.is_empty(),
            num_gpus: totals.len(),
            first_gpu_vram: totals.first().copied().unwrap_or_default(),
            total_vram: totals.iter().sum(),
            error: None,
        }
    }
}

/// Tells whether models can be placed on a GPU.
#[async_trait]
pub trait GpuProbe: Send + Sync + 'static {
    async fn gpu_info(&self) -> GpuInfo;

    async fn gpu_available(&self) -> bool {
        self.gpu_info().await.gpu_found
    }
}

/// Queries GPUs through `nvidia-smi`. The result is computed once and then reused.
#[derive(Debug)]
pub struct NvidiaSmiProbe {
    enabled: bool,
    info: OnceCell<GpuInfo>,
}

impl NvidiaSmiProbe {
    /// A disabled probe never reports a GPU.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            info: OnceCell::new(),
        }
    }

    async fn query(&self) -> GpuInfo {
        if !self.enabled {
            return GpuInfo::unavailable("GPU detection is disabled");
        }
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
            .stdin(Stdio::null())
            .output()
            .await;
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                return GpuInfo::unavailable(format!("nvidia-smi failed with {}", output.status));
            }
            Err(err) => return GpuInfo::unavailable(format!("nvidia-smi not available: {err}")),
        };

        match parse_memory_totals(&String::from_utf8_lossy(&output.stdout)) {
            Ok(totals) => GpuInfo::from_memory_totals(&totals),
            Err(err) => GpuInfo::unavailable(format!("unexpected nvidia-smi output: {err}")),
        }
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmiProbe {
    async fn gpu_info(&self) -> GpuInfo {
        let info = self.info.get_or_init(|| self.query()).await;
        if let Some(ref error) = info.error {
            tracing::debug!("No GPU available: {error}");
        }
        info.clone()
    }
}

/// Parses one `memory.total` value in MiB per line.
fn parse_memory_totals(output: &str) -> Result<Vec<u64>, std::num::ParseIntError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}
