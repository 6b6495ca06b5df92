//! Messages between the reply pump and the control loop.

use crate::server::error::ProxyError;

use tokio::sync::mpsc::{Receiver, Sender};

// Sent by the reply pump (or its runner task) to the control loop.
#[derive(Debug)]
pub(crate) enum ControlChanMsg {
    // Origin acknowledged a login (230/232); time to consider a switch.
    LoginOk { code: u16 },
    // Origin closed its control connection.
    OriginClosed,
    // The pump died on a read or write error.
    PumpFailed(ProxyError),
}

pub(crate) type ControlChanSender = Sender<ControlChanMsg>;
pub(crate) type ControlChanReceiver = Receiver<ControlChanMsg>;

// The receiving halves of the pump coordination channels, owned by the pump
// runner task. The sending halves live on the ProxyServer.
pub(crate) struct PumpChannels {
    // Rendezvous asking the pump to park.
    pub stop_rx: Receiver<()>,
    // Pump's acknowledgement that it parked.
    pub stop_done_tx: Sender<()>,
    // Switch outcome; true restarts the pump against the new origin.
    pub switch_rx: Receiver<bool>,
}
