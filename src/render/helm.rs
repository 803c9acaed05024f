//! Chart rendering through the helm CLI
//!
//! Charts are read from a local directory (baked into the operator image),
//! so rendering never touches the network.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ChartRenderer, RenderRequest};
use crate::yaml::to_yaml;
use crate::Error;

/// Where charts live inside the operator image
pub const DEFAULT_CHARTS_DIR: &str = "/charts";

/// helm binary looked up on PATH
pub const DEFAULT_HELM_BIN: &str = "helm";

/// Renders charts with `helm template`
#[derive(Clone, Debug)]
pub struct HelmRenderer {
    helm_bin: String,
    charts_dir: PathBuf,
}

impl Default for HelmRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_HELM_BIN, DEFAULT_CHARTS_DIR)
    }
}

impl HelmRenderer {
    /// Renderer using `helm_bin` against charts under `charts_dir`
    pub fn new(helm_bin: impl Into<String>, charts_dir: impl Into<PathBuf>) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            charts_dir: charts_dir.into(),
        }
    }

    /// Arguments passed to helm for one request. Values arrive on stdin.
    pub fn template_args(&self, request: &RenderRequest) -> Vec<String> {
        vec![
            "template".to_string(),
            request.component.spec_key().to_string(),
            self.charts_dir.join(&request.chart).display().to_string(),
            "--namespace".to_string(),
            request.namespace.clone(),
            "--values".to_string(),
            "-".to_string(),
        ]
    }
}

#[async_trait]
impl ChartRenderer for HelmRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<String, Error> {
        let values = to_yaml(&request.values)?;
        let args = self.template_args(request);
        info!(component = %request.component, chart = %request.chart, "rendering chart");

        let mut child = Command::new(&self.helm_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::render(request.component, format!("failed to run {}: {e}", self.helm_bin))
            })?;

        // helm reads all values before it writes anything, so writing first
        // cannot fill the stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(values.as_bytes())
                .await
                .map_err(|e| Error::render(request.component, format!("writing values: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::render(request.component, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::render(
                request.component,
                format!("helm template failed: {}", stderr.trim()),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(component = %request.component, bytes = text.len(), "chart rendered");
        Ok(text)
    }
}
