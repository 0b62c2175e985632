use std::sync::Arc;

use async_trait::async_trait;
use ekko_supervisor_core::{error::SupervisorError, MessageBus, PipelineSupervisor};

use super::SupervisorActor;

/// Drives a [`PipelineSupervisor`]'s reconcile loop as a supervisor actor. The pipeline
/// supervisor owns its [`FetcherSupervisor`](ekko_supervisor_core::FetcherSupervisor)
/// outright (§3), so this one actor is all the reconciliation work `Service` needs to spawn.
pub struct PipelineSupervisorActor<B: MessageBus> {
    supervisor: Arc<PipelineSupervisor<B>>,
}

impl<B: MessageBus> PipelineSupervisorActor<B> {
    pub fn new(supervisor: Arc<PipelineSupervisor<B>>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl<B: MessageBus + 'static> SupervisorActor for PipelineSupervisorActor<B> {
    type InboundEvent = ();
    type Error = SupervisorError;

    async fn start(mut self) -> Result<(), Self::Error> {
        self.supervisor.run().await
    }
}
