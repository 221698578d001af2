//! Controlling the entire operation.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated};
use crate::units::admin::AdminUnit;
use crate::units::http_server::HttpServer;
use crate::units::signer::SignerUnit;

/// Spawn all units.
pub async fn spawn(
    center: &Arc<Center>,
    unit_tx_slots: &mut std::collections::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) -> Result<(), Terminated> {
    let mut unit_ready_rxs = vec![];
    let mut unit_join_handles = std::collections::HashMap::new();

    // Spawn the signer endpoints.
    info!("Starting unit 'SG'");
    let unit = SignerUnit {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("SG", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("SG".into(), cmd_tx);

    // Spawn the admin channel.
    info!("Starting unit 'AC'");
    let unit = AdminUnit {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("AC", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("AC".into(), cmd_tx);

    // Spawn the HTTP server.
    info!("Starting unit 'HS'");
    let unit = HttpServer {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("HS", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("HS".into(), cmd_tx);

    join_all(unit_ready_rxs).await;

    // None of the units should have exited already.
    if let Some(failed_unit) = unit_join_handles
        .iter()
        .find_map(|(unit, handle)| handle.is_finished().then_some(unit))
    {
        error!("Unit '{failed_unit}' terminated unexpectedly. Aborting.");
        return Err(Terminated);
    }

    info!("All units report ready.");

    Ok(())
}

/// Forward application commands to their units.
pub async fn forward_app_cmds(
    rx: &mut mpsc::UnboundedReceiver<(String, ApplicationCommand)>,
    unit_txs: &std::collections::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) {
    while let Some((unit_name, data)) = rx.recv().await {
        if let Some(tx) = unit_txs.get(&unit_name) {
            debug!("Forwarding application command to unit '{unit_name}'");
            let _ = tx.send(data);
        } else {
            debug!("Unrecognized unit: {unit_name}");
        }
    }
}
