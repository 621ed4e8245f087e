//! Server state

use std::sync::Arc;

use crate::app::state::AppState;
use crate::progress::ProgressHub;
use crate::reconcile::ReconcileEngine;
use crate::rollout::RolloutOrchestrator;
use crate::vault::VaultRouter;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Arc<ReconcileEngine>,
    pub rollout: Arc<RolloutOrchestrator>,
    pub vault: VaultRouter,
    pub progress: ProgressHub,
    pub workspace: String,
}

impl ServerState {
    pub fn new(
        engine: Arc<ReconcileEngine>,
        rollout: Arc<RolloutOrchestrator>,
        vault: VaultRouter,
        progress: ProgressHub,
        workspace: String,
    ) -> Self {
        Self {
            engine,
            rollout,
            vault,
            progress,
            workspace,
        }
    }

    pub fn from_app(app: &AppState) -> Self {
        Self::new(
            app.engine.clone(),
            app.rollout.clone(),
            app.vault.clone(),
            app.progress.clone(),
            app.workspace.clone(),
        )
    }
}
