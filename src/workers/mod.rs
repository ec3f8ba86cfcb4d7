pub mod expiration;
pub mod nda;
pub mod notifications;

use std::sync::Arc;

use crate::state::AppState;

/// Registers the durable bus consumers and spawns the periodic
/// sweeper.
pub fn start(state: &Arc<AppState>) -> anyhow::Result<()> {
    state.bus.register(
        nda::consumer_config(),
        Arc::new(nda::NdaDispatcher::new(state)),
    )?;
    state.bus.register(
        notifications::confirmation_config(),
        Arc::new(notifications::ConfirmationNotifier::new(state)),
    )?;
    state.bus.register(
        notifications::sender_config(),
        Arc::new(notifications::EmailSender::new(state)),
    )?;
    expiration::spawn(Arc::clone(state));
    Ok(())
}
