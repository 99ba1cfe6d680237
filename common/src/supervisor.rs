//! Connectivity supervisor: the bring-up and steady-state machine.
//!
//! The supervisor is pure. It consumes outcome events from the bridge driver
//! and answers with the side effects to perform next; it never touches I/O
//! itself. That keeps the phase order, the retry budgets and the
//! restart-exactly-once behavior testable without hardware.

use crate::config::RetryConfig;

/// Connection phase. Advances strictly forward through the bring-up order on
/// success; the only lateral move is `BrokerConnected -> Degraded ->
/// BrokerConnecting` when a live session fails its liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    WifiJoining,
    WifiJoined,
    TimeSyncing,
    TimeSynced,
    BrokerConnecting,
    BrokerConnected,
    Degraded,
}

impl Phase {
    /// Legal single-step transitions. Everything else is a bug.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Unjoined, Phase::WifiJoining)
                | (Phase::WifiJoining, Phase::WifiJoined)
                | (Phase::WifiJoined, Phase::TimeSyncing)
                | (Phase::TimeSyncing, Phase::TimeSynced)
                | (Phase::TimeSynced, Phase::BrokerConnecting)
                | (Phase::BrokerConnecting, Phase::BrokerConnected)
                | (Phase::BrokerConnected, Phase::Degraded)
                | (Phase::Degraded, Phase::BrokerConnecting)
        )
    }
}

/// Outcome of one driver-side operation, fed back into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PowerOn,
    WifiPoll { connected: bool },
    UpdateCheckDone,
    ClockPoll { synced: bool },
    BrokerConnect { connected: bool },
    Liveness { alive: bool },
    CycleComplete,
}

/// Side effect the driver must perform, in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SetWifiIndicator(bool),
    SetBrokerIndicator(bool),
    BeginWifiJoin,
    PollWifi,
    RunUpdateCheck,
    BeginClockSync,
    PollClock,
    OpenBrokerSession,
    CloseBrokerSession,
    ProbeLiveness,
    RefreshIdleIndicator,
    PublishTelemetry,
    DrainCommands,
    Sleep(u64),
    Restart,
}

/// Per-phase countdown of allowed consecutive failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    ceiling: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            remaining: ceiling,
        }
    }

    /// Back to the configured ceiling; called whenever the phase is
    /// re-entered after a successful prior phase.
    pub fn reset(&mut self) {
        self.remaining = self.ceiling;
    }

    /// Records one failed attempt. Returns `true` when the budget is spent.
    pub fn spend(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[derive(Debug)]
pub struct ConnectivitySupervisor {
    phase: Phase,
    retry: RetryConfig,
    wifi_budget: RetryBudget,
    sync_budget: RetryBudget,
    broker_budget: RetryBudget,
    restart_latched: bool,
}

impl ConnectivitySupervisor {
    pub fn new(retry: RetryConfig) -> Self {
        let wifi_budget = RetryBudget::new(retry.wifi_poll_attempts);
        let sync_budget = RetryBudget::new(retry.sync_poll_attempts);
        let broker_budget = RetryBudget::new(retry.broker_connect_attempts);
        Self {
            phase: Phase::Unjoined,
            retry,
            wifi_budget,
            sync_budget,
            broker_budget,
            restart_latched: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_latched(&self) -> bool {
        self.restart_latched
    }

    /// Transition function. Events that do not belong to the current phase
    /// are ignored and produce no effects.
    pub fn on_event(&mut self, event: Event) -> Vec<Effect> {
        if self.restart_latched {
            // The restart action fires exactly once; after that the machine
            // is inert until the device actually goes down.
            return Vec::new();
        }

        match (self.phase, event) {
            (Phase::Unjoined, Event::PowerOn) => {
                self.wifi_budget.reset();
                self.advance(Phase::WifiJoining);
                vec![
                    Effect::SetWifiIndicator(false),
                    Effect::SetBrokerIndicator(false),
                    Effect::BeginWifiJoin,
                    Effect::PollWifi,
                ]
            }
            (Phase::WifiJoining, Event::WifiPoll { connected: true }) => {
                self.advance(Phase::WifiJoined);
                vec![Effect::SetWifiIndicator(true), Effect::RunUpdateCheck]
            }
            (Phase::WifiJoining, Event::WifiPoll { connected: false }) => {
                if self.wifi_budget.spend() {
                    self.latch_restart()
                } else {
                    vec![Effect::Sleep(self.retry.wifi_poll_ms), Effect::PollWifi]
                }
            }
            (Phase::WifiJoined, Event::UpdateCheckDone) => {
                self.sync_budget.reset();
                self.advance(Phase::TimeSyncing);
                vec![Effect::BeginClockSync, Effect::PollClock]
            }
            (Phase::TimeSyncing, Event::ClockPoll { synced: true }) => {
                self.advance(Phase::TimeSynced);
                self.broker_budget.reset();
                self.advance(Phase::BrokerConnecting);
                vec![Effect::OpenBrokerSession]
            }
            (Phase::TimeSyncing, Event::ClockPoll { synced: false }) => {
                if self.sync_budget.spend() {
                    self.latch_restart()
                } else {
                    vec![Effect::Sleep(self.retry.sync_poll_ms), Effect::PollClock]
                }
            }
            (Phase::BrokerConnecting, Event::BrokerConnect { connected: true }) => {
                self.advance(Phase::BrokerConnected);
                vec![Effect::SetBrokerIndicator(true), Effect::ProbeLiveness]
            }
            (Phase::BrokerConnecting, Event::BrokerConnect { connected: false }) => {
                if self.broker_budget.spend() {
                    self.latch_restart()
                } else {
                    vec![
                        Effect::CloseBrokerSession,
                        Effect::Sleep(self.retry.broker_retry_ms),
                        Effect::OpenBrokerSession,
                    ]
                }
            }
            (Phase::BrokerConnected, Event::Liveness { alive: true }) => {
                vec![
                    Effect::RefreshIdleIndicator,
                    Effect::PublishTelemetry,
                    Effect::DrainCommands,
                ]
            }
            (Phase::BrokerConnected, Event::Liveness { alive: false }) => {
                self.advance(Phase::Degraded);
                vec![Effect::CloseBrokerSession, Effect::SetBrokerIndicator(false)]
            }
            (Phase::BrokerConnected, Event::CycleComplete) => {
                vec![Effect::ProbeLiveness]
            }
            (Phase::Degraded, Event::CycleComplete) => {
                self.broker_budget.reset();
                self.advance(Phase::BrokerConnecting);
                vec![Effect::OpenBrokerSession]
            }
            _ => Vec::new(),
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    fn latch_restart(&mut self) -> Vec<Effect> {
        self.restart_latched = true;
        vec![Effect::Restart]
    }
}
