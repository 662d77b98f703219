//! Isolated-mode bootstrap.
//!
//! Before user code may run isolated, a trusted loader image is handed to the
//! coprocessor under escalated privilege. The sequence must leave the
//! problem-state bit restored on every exit path, and a failed load must
//! leave the unit in a state the generic stop classification can report.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::config::types::{CoprunError, EngineConfig, Result};
use crate::hw::resource::CoprocessorOps;
use crate::hw::status::{RunControl, StatusBits};
use std::time::Instant;

/// Trusted loader registered once at engine init.
pub struct LoaderImage {
    bytes: Vec<u8>,
    entry: u64,
    digest: String,
}

impl LoaderImage {
    pub fn new(bytes: Vec<u8>, entry: u64) -> Self {
        let digest = format!("{:x}", Sha256::digest(&bytes));
        info!(
            "isolated loader image registered: {} bytes, entry {entry:#x}, sha256 {digest}",
            bytes.len()
        );
        Self {
            bytes,
            entry,
            digest,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// How the bootstrap left the unit. Only hard errors abort the run; the two
/// failure outcomes fall through to generic stop classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolatedBoot {
    /// Loader accepted; the unit is running isolated.
    Entered,
    /// Load refused: the unit was re-armed plain-runnable and will report its
    /// own stop.
    LoadDenied,
    /// The unit claims to run without entering isolation; force-stopped.
    StateInvalid,
}

/// Escalate privilege, start the loader and wait for it to leave the loading
/// state. Caller must hold exclusive context/resource access.
pub fn setup_isolated(
    res: &dyn CoprocessorOps,
    loader: Option<&LoaderImage>,
    config: &EngineConfig,
) -> Result<IsolatedBoot> {
    let loader = loader.ok_or_else(|| {
        CoprunError::Unsupported("isolated mode requested without a registered loader".to_string())
    })?;

    // Exclude host access to the windows while privileged.
    res.revoke_mappings();

    // No in-flight DMA may survive into the privileged window.
    res.purge_dma_queue(config.dma_purge_timeout)?;

    res.set_problem_state(false)?;
    let outcome = start_loader(res, loader, config);

    // Finished accessing the loader; drop privilege on every path.
    if let Err(e) = res.set_problem_state(true) {
        warn!("failed to restore problem state after bootstrap: {e}");
        return Err(e);
    }

    outcome
}

fn start_loader(
    res: &dyn CoprocessorOps,
    loader: &LoaderImage,
    config: &EngineConfig,
) -> Result<IsolatedBoot> {
    res.write_signal1((loader.entry() >> 32) as u32)?;
    res.write_signal2((loader.entry() & 0xffff_ffff) as u32)?;
    res.write_run_control(RunControl::RUNNABLE | RunControl::ISOLATE)?;

    let loading =
        StatusBits::RUNNING | StatusBits::ISOLATED_STATE | StatusBits::ISOLATED_LOAD_STATUS;
    let start = Instant::now();
    let status = loop {
        let status = res.read_status();
        if status.raw() & loading.bits() != loading.bits() {
            break status;
        }
        if start.elapsed() > config.loader_poll_timeout {
            return Err(CoprunError::Timeout {
                what: "waiting for the isolated loader",
                waited: config.loader_poll_timeout,
            });
        }
        std::thread::yield_now();
    };

    if !status.running() {
        // The load was refused. Re-arm plain runnable; the unit will deliver
        // its own stop-and-signal for the generic classification path.
        debug!("isolated load refused, status {:#x}", status.raw());
        res.write_run_control(RunControl::RUNNABLE)?;
        return Ok(IsolatedBoot::LoadDenied);
    }

    if !status.isolated_state() {
        // Not a state the hardware contract allows; stop the unit.
        warn!("coprocessor left isolation during load, status {:#x}", status.raw());
        res.write_run_control(RunControl::empty())?;
        return Ok(IsolatedBoot::StateInvalid);
    }

    Ok(IsolatedBoot::Entered)
}
