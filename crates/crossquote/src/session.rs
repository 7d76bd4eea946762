use async_trait::async_trait;
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::broadcast;

use crate::{
    errors::CoreError,
    feed::{NativeBalanceFeed, NativeBalanceSource},
    types::{Account, ChainKind, NativeBalance},
};

const EVENT_CAPACITY: usize = 64;

/// The external wallet (browser extension, hardware bridge, ...). Handshakes live behind it.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    fn kind(&self) -> ChainKind;
    async fn has_provider(&self) -> bool;
    /// Ask the user to pick a wallet.
    async fn open_selection(&self) -> Result<(), CoreError>;
    async fn connect(&self) -> Result<Account, CoreError>;
    async fn disconnect(&self) -> Result<(), CoreError>;
}

/// Watch-only connector for a known address. Always present, never refuses.
#[derive(Debug, Clone)]
pub struct AddressConnector {
    account: Account,
}

impl AddressConnector {
    pub const fn new(account: Account) -> Self {
        Self { account }
    }
}

#[async_trait]
impl WalletConnector for AddressConnector {
    fn kind(&self) -> ChainKind {
        self.account.kind
    }

    async fn has_provider(&self) -> bool {
        true
    }

    async fn open_selection(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn connect(&self) -> Result<Account, CoreError> {
        Ok(self.account.clone())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { account: Account },
}

impl SessionState {
    pub const fn account(&self) -> Option<&Account> {
        match self {
            Self::Connected { account } => Some(account),
            Self::Disconnected | Self::Connecting => None,
        }
    }

    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Also the signal to refresh balances once.
    Connected { account: Account },
    AccountChanged { previous: Account, current: Account },
    BalanceChanged { account: Account, balance: NativeBalance },
    Disconnected { account: Account },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(Account),
    /// No wallet was present; the connector's selection flow was opened instead.
    SelectionRequested,
}

pub struct WalletSession {
    kind: ChainKind,
    connector: Arc<dyn WalletConnector>,
    native: Option<Arc<dyn NativeBalanceSource>>,
    poll_interval: Duration,
    state: Mutex<SessionState>,
    feed: Mutex<Option<NativeBalanceFeed>>,
    events: broadcast::Sender<SessionEvent>,
}

impl WalletSession {
    pub fn new(
        connector: Arc<dyn WalletConnector>,
        native: Option<Arc<dyn NativeBalanceSource>>,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind: connector.kind(),
            connector,
            native,
            poll_interval,
            state: Mutex::new(SessionState::Disconnected),
            feed: Mutex::new(None),
            events,
        }
    }

    fn state_lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn feed_lock(&self) -> MutexGuard<'_, Option<NativeBalanceFeed>> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state_lock() = next;
    }

    fn emit(&self, event: SessionEvent) {
        tracing::debug!(kind = self.kind.as_str(), ?event, "session event");
        if self.events.send(event).is_err() {
            tracing::trace!("no session subscribers");
        }
    }

    pub const fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state_lock().clone()
    }

    pub fn account(&self) -> Option<Account> {
        self.state_lock().account().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.state_lock().is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Latest value from the native feed, if one is open and has produced a value.
    pub fn native_balance(&self) -> Option<NativeBalance> {
        self.feed_lock().as_ref().and_then(NativeBalanceFeed::latest)
    }

    pub fn native_feed_account(&self) -> Option<Account> {
        self.feed_lock()
            .as_ref()
            .filter(|f| !f.is_closed())
            .map(|f| f.account().clone())
    }

    fn open_feed(&self, account: &Account) {
        let Some(source) = &self.native else {
            return;
        };
        let events = self.events.clone();
        let changed = account.clone();
        let feed = NativeBalanceFeed::spawn(
            Arc::clone(source),
            account.clone(),
            self.poll_interval,
            move |balance| {
                let ev = SessionEvent::BalanceChanged {
                    account: changed.clone(),
                    balance: *balance,
                };
                if events.send(ev).is_err() {
                    tracing::trace!("no session subscribers");
                }
            },
        );
        // Replacing drops (and closes) any previous feed.
        *self.feed_lock() = Some(feed);
    }

    fn close_feed(&self) {
        if let Some(mut feed) = self.feed_lock().take() {
            feed.close();
        }
    }

    pub async fn connect(&self) -> Result<ConnectOutcome, CoreError> {
        // Claim the session before the first await so concurrent callers see `Connecting`.
        {
            let mut state = self.state_lock();
            match &*state {
                SessionState::Connected { account } => {
                    return Ok(ConnectOutcome::Connected(account.clone()))
                }
                SessionState::Connecting => {
                    return Err(CoreError::InvalidInput("connect already in progress".to_owned()))
                }
                SessionState::Disconnected => {}
            }
            *state = SessionState::Connecting;
        }

        if !self.connector.has_provider().await {
            self.set_state(SessionState::Disconnected);
            tracing::info!(kind = self.kind.as_str(), "no wallet provider; opening selection");
            self.connector.open_selection().await?;
            return Ok(ConnectOutcome::SelectionRequested);
        }

        let account = match self.connector.connect().await {
            Ok(a) if a.kind == self.kind => a,
            Ok(a) => {
                self.set_state(SessionState::Disconnected);
                return Err(CoreError::InvalidInput(format!(
                    "connector returned a {} account for a {} session",
                    a.kind.as_str(),
                    self.kind.as_str()
                )));
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                tracing::warn!(kind = self.kind.as_str(), error = %e, "wallet connect failed");
                return Err(e);
            }
        };

        self.set_state(SessionState::Connected {
            account: account.clone(),
        });
        self.open_feed(&account);
        tracing::info!(kind = self.kind.as_str(), address = %account.address, "wallet connected");
        self.emit(SessionEvent::Connected {
            account: account.clone(),
        });
        Ok(ConnectOutcome::Connected(account))
    }

    /// The connected wallet reported a different address or chain.
    pub fn switch_account(&self, current: Account) -> Result<(), CoreError> {
        if current.kind != self.kind {
            return Err(CoreError::InvalidInput(format!(
                "cannot switch a {} session to a {} account",
                self.kind.as_str(),
                current.kind.as_str()
            )));
        }
        let previous = {
            let mut state = self.state_lock();
            let Some(previous) = state.account().cloned() else {
                return Err(CoreError::InvalidInput("session is not connected".to_owned()));
            };
            if previous == current {
                return Ok(());
            }
            *state = SessionState::Connected {
                account: current.clone(),
            };
            previous
        };

        self.close_feed();
        self.open_feed(&current);
        self.emit(SessionEvent::AccountChanged { previous, current });
        Ok(())
    }

    /// Disconnect through the connector. If the connector refuses, the wallet is still live and
    /// the session stays connected.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        let Some(account) = self.account() else {
            return Ok(());
        };

        if let Err(e) = self.connector.disconnect().await {
            tracing::warn!(kind = self.kind.as_str(), error = %e, "wallet disconnect failed");
            return Err(match e {
                CoreError::Disconnect(_) => e,
                other => CoreError::Disconnect(other.to_string()),
            });
        }

        self.close_feed();
        self.set_state(SessionState::Disconnected);
        tracing::info!(kind = self.kind.as_str(), "wallet disconnected");
        self.emit(SessionEvent::Disconnected { account });
        Ok(())
    }
}

impl Drop for WalletSession {
    fn drop(&mut self) {
        self.close_feed();
    }
}
