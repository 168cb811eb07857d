//! Epoch coordination for one TLS connection.
//!
//! Both directions of a [`Flow`] are parsed independently, but a new epoch
//! only exists once: the first direction to reach a ChangeCipherSpec builds
//! it and takes its own half, the other direction picks up the remaining half
//! when it reaches its own ChangeCipherSpec.
//!
//! All of this runs on the caller's thread from [`Flow::add`] and
//! [`Flow::finish`]; each direction gets `&mut` access to the shared epoch
//! state only for the duration of its own parse pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::connstate::{ConnStatePeriod, ConnStatePlex, ConnectionStateParams, EpochId};
use super::direction::{Direction, DirectionId};
use super::handshake::HandshakeEvent;
use super::keylog::KeyLog;
use crate::protocol::TcpSegment;
use crate::reassembly::{Side, TcpFlow, TcpHandshake};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Which TCP side is the TLS client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ClientSide {
    /// ClientHello sender, falling back to the SYN sender, then the first sender.
    #[default]
    Auto,
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    pub client_side: ClientSide,
    pub keylog: Option<Arc<KeyLog>>,
}

impl FlowConfig {
    pub fn with_keylog(keylog: KeyLog) -> Self {
        FlowConfig {
            keylog: Some(Arc::new(keylog)),
            ..Self::default()
        }
    }
}

/// Rendezvous slot for the epoch being handed out.
#[derive(Debug)]
enum Rendezvous {
    Idle,
    AwaitingPartner {
        period: Arc<ConnStatePeriod>,
        remaining: Side,
    },
}

/// Epoch state shared by the two directions of a flow.
#[derive(Debug)]
pub(crate) struct ConnStates {
    flow_id: u64,
    config: FlowConfig,
    current: Option<Arc<ConnStatePeriod>>,
    rendezvous: Rendezvous,
    pending_params: ConnectionStateParams,
    old_states: Vec<Arc<ConnStatePeriod>>,
    next_epoch: u64,
    /// Sender of the first ClientHello seen on this flow.
    hello_side: Option<Side>,
    /// Connecting side according to the TCP handshake.
    tcp_client_side: Option<Side>,
}

impl ConnStates {
    pub(crate) fn new(flow_id: u64, config: FlowConfig) -> Self {
        ConnStates {
            flow_id,
            config,
            current: None,
            rendezvous: Rendezvous::Idle,
            pending_params: ConnectionStateParams::new(),
            old_states: Vec::new(),
            next_epoch: 0,
            hello_side: None,
            tcp_client_side: None,
        }
    }

    /// Hand `requester` its half of the next epoch.
    ///
    /// # Panics
    ///
    /// If `requester` belongs to another flow, or if the same side asks twice
    /// before the other side has claimed its half.
    pub(crate) fn next_connstate(&mut self, requester: DirectionId) -> Arc<ConnStatePlex> {
        assert_eq!(
            requester.flow, self.flow_id,
            "{requester} requested an epoch from flow#{}",
            self.flow_id
        );

        match std::mem::replace(&mut self.rendezvous, Rendezvous::Idle) {
            Rendezvous::Idle => {
                let params = std::mem::take(&mut self.pending_params);
                let period = Arc::new(self.build_period(params));
                tracing::debug!(
                    flow = self.flow_id,
                    epoch = %period.epoch(),
                    first = %requester.side,
                    client = %period.client_side(),
                    "new epoch"
                );
                if let Some(retired) = self.current.replace(Arc::clone(&period)) {
                    self.old_states.push(retired);
                }
                let plex = Arc::clone(period.plex(requester.side));
                self.rendezvous = Rendezvous::AwaitingPartner {
                    period,
                    remaining: requester.side.opposite(),
                };
                plex
            }
            Rendezvous::AwaitingPartner { period, remaining } => {
                assert_eq!(
                    requester.side,
                    remaining,
                    "{requester} requested a second plex of {} before {remaining} claimed its half",
                    period.epoch()
                );
                Arc::clone(period.plex(remaining))
            }
        }
    }

    fn build_period(&mut self, params: ConnectionStateParams) -> ConnStatePeriod {
        let epoch = EpochId(self.next_epoch);
        self.next_epoch += 1;
        let client_side = self.resolve_client_side(&params);
        match self.current.as_ref().map(|period| period.epoch()) {
            None => ConnStatePeriod::initial(epoch, client_side),
            Some(predecessor) => ConnStatePeriod::negotiated(
                epoch,
                predecessor,
                params,
                self.config.keylog.as_deref(),
                client_side,
            ),
        }
    }

    fn resolve_client_side(&self, params: &ConnectionStateParams) -> Side {
        match self.config.client_side {
            ClientSide::Forward => Side::Forward,
            ClientSide::Reverse => Side::Reverse,
            ClientSide::Auto => params
                .client_side()
                .or(self.hello_side)
                .or(self.tcp_client_side)
                .unwrap_or_else(|| {
                    tracing::debug!(
                        flow = self.flow_id,
                        "client side unknown, assuming first sender"
                    );
                    Side::Forward
                }),
        }
    }

    pub(crate) fn observe_handshake(&mut self, from: Side, event: &HandshakeEvent) {
        tracing::trace!(flow = self.flow_id, %from, ?event, "handshake message");
        if let HandshakeEvent::ClientHello { offers_tls13, .. } = event {
            self.hello_side.get_or_insert(from);
            if *offers_tls13 {
                tracing::debug!(flow = self.flow_id, "client offers TLS 1.3");
            }
        }
        self.pending_params.apply(event, from);
    }

    pub(crate) fn pending_params(&self) -> &ConnectionStateParams {
        &self.pending_params
    }

    /// Side still owed a plex of the newest epoch.
    pub(crate) fn awaiting(&self) -> Option<Side> {
        match &self.rendezvous {
            Rendezvous::Idle => None,
            Rendezvous::AwaitingPartner { remaining, .. } => Some(*remaining),
        }
    }
}

/// A TLS connection reconstructed from captured TCP packets.
#[derive(Debug)]
pub struct Flow {
    tcp: TcpFlow,
    fwd: Direction,
    rev: Direction,
    states: ConnStates,
}

impl Flow {
    pub fn new(tcp: TcpFlow) -> Self {
        Self::with_config(tcp, FlowConfig::default())
    }

    /// Wrap a TCP flow, install the initial epoch on both directions and
    /// parse whatever the flow has already reassembled.
    pub fn with_config(tcp: TcpFlow, config: FlowConfig) -> Self {
        let id = NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed);
        let mut states = ConnStates::new(id, config);
        states.tcp_client_side = tcp.handshake().client_side();

        let mut flow = Flow {
            tcp,
            fwd: Direction::new(DirectionId {
                flow: id,
                side: Side::Forward,
            }),
            rev: Direction::new(DirectionId {
                flow: id,
                side: Side::Reverse,
            }),
            states,
        };
        flow.fwd.on_change_cipher_spec(&mut flow.states);
        flow.rev.on_change_cipher_spec(&mut flow.states);
        flow.update_records();
        flow
    }

    /// Feed one segment. Returns the side it was filed under, or `None` if
    /// it belongs to another connection or the flow is finished.
    pub fn add(&mut self, segment: &TcpSegment) -> Option<Side> {
        if self.tcp.is_finished() {
            tracing::warn!(flow = self.id(), "segment added after finish, ignoring");
            return None;
        }
        let side = self.tcp.add(segment)?;
        self.update_records();
        Some(side)
    }

    /// End of input: flush reassembly and parse what remains.
    pub fn finish(&mut self) {
        if self.tcp.is_finished() {
            return;
        }
        self.tcp.finish();
        self.update_records();
    }

    fn update_records(&mut self) {
        self.states.tcp_client_side = self.tcp.handshake().client_side();
        // A direction parked at a ChangeCipherSpec can move again once the
        // other side claims; every extra pass consumes at least that record.
        loop {
            self.fwd
                .update_records(self.tcp.half_mut(Side::Forward), &mut self.states);
            self.rev
                .update_records(self.tcp.half_mut(Side::Reverse), &mut self.states);
            let awaiting = self.states.awaiting();
            let fwd_ready = self.fwd.is_waiting() && awaiting != Some(Side::Reverse);
            let rev_ready = self.rev.is_waiting() && awaiting != Some(Side::Forward);
            if !fwd_ready && !rev_ready {
                break;
            }
        }
    }

    /// Hand `requester` its half of the next epoch; see [`Direction`].
    ///
    /// # Panics
    ///
    /// If `requester` is not one of this flow's directions, or if its side
    /// already holds the newest epoch while the other side has not claimed it.
    pub fn next_connstate(&mut self, requester: DirectionId) -> Arc<ConnStatePlex> {
        self.states.next_connstate(requester)
    }

    /// Apply a ChangeCipherSpec to `side` as if one had been parsed.
    pub fn change_cipher_spec(&mut self, side: Side) {
        match side {
            Side::Forward => self.fwd.on_change_cipher_spec(&mut self.states),
            Side::Reverse => self.rev.on_change_cipher_spec(&mut self.states),
        }
    }

    pub fn handshake(&self) -> &TcpHandshake {
        self.tcp.handshake()
    }

    pub fn id(&self) -> u64 {
        self.states.flow_id
    }

    pub fn fwd(&self) -> &Direction {
        &self.fwd
    }

    pub fn rev(&self) -> &Direction {
        &self.rev
    }

    pub fn direction(&self, side: Side) -> &Direction {
        match side {
            Side::Forward => &self.fwd,
            Side::Reverse => &self.rev,
        }
    }

    /// Newest epoch.
    pub fn connstate(&self) -> Option<&Arc<ConnStatePeriod>> {
        self.states.current.as_ref()
    }

    /// Newest epoch while one side has yet to claim its half.
    pub fn pending(&self) -> Option<&Arc<ConnStatePeriod>> {
        match &self.states.rendezvous {
            Rendezvous::Idle => None,
            Rendezvous::AwaitingPartner { period, .. } => Some(period),
        }
    }

    /// Superseded epochs, oldest first.
    pub fn old_states(&self) -> &[Arc<ConnStatePeriod>] {
        &self.states.old_states
    }

    /// Parameters collected so far for the next epoch.
    pub fn pending_params(&self) -> &ConnectionStateParams {
        &self.states.pending_params
    }

    /// TLS client side of the newest epoch.
    pub fn client_side(&self) -> Option<Side> {
        self.connstate().map(|period| period.client_side())
    }

    pub fn tcp(&self) -> &TcpFlow {
        &self.tcp
    }

    pub fn is_finished(&self) -> bool {
        self.tcp.is_finished()
    }
}
