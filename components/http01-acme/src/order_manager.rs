use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http01_challenger::{challenge_path, ChallengeDirectory};
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::bundle::generate_csr;
use crate::retry::{attempts, with_retry, Backoff};
use crate::{
    AcmeError, AcmeOrder, AcmeResult, AcmeStatus, AcmeTransport, AcmeTransportRef, CertBundle, DomainSet,
    OrderManagerConfig, RetryPolicy,
};

/// Where the order manager publishes HTTP-01 responses.
pub trait ChallengeRegistry: Send + Sync {
    fn register_challenge(&self, path: &str, payload: &str);
    fn unregister_challenge(&self, path: &str);
}

pub type ChallengeRegistryRef = Arc<dyn ChallengeRegistry>;

impl ChallengeRegistry for ChallengeDirectory {
    fn register_challenge(&self, path: &str, payload: &str) {
        ChallengeDirectory::register_challenge(self, path, payload)
    }

    fn unregister_challenge(&self, path: &str) {
        ChallengeDirectory::unregister_challenge(self, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Pending,
    Validating,
    Finalizing,
    Ready,
    Failed,
}

impl Display for OrderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            OrderPhase::Pending => "pending",
            OrderPhase::Validating => "validating",
            OrderPhase::Finalizing => "finalizing",
            OrderPhase::Ready => "ready",
            OrderPhase::Failed => "failed",
        };
        write!(f, "{}", str)
    }
}

/// State of one order attempt. `bundle` is only set when `Ready`, `error`
/// only when `Failed`.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub phase: OrderPhase,
    pub challenge_urls: Vec<Url>,
    pub bundle: Option<Arc<CertBundle>>,
    pub error: Option<AcmeError>,
}

impl OrderSnapshot {
    fn pending() -> Self {
        Self {
            phase: OrderPhase::Pending,
            challenge_urls: vec![],
            bundle: None,
            error: None,
        }
    }
}

/// Answer of [`OrderManager::order`]: challenge URLs while the order is in
/// flight, the certificate once it is ready.
#[derive(Debug, Clone, Default)]
pub struct OrderOutcome {
    pub challenge_urls: Vec<Url>,
    pub bundle: Option<Arc<CertBundle>>,
}

/// Sent once per completed order to the ready notifier.
#[derive(Debug, Clone)]
pub struct OrderReady {
    pub domains: DomainSet,
    pub owners: Vec<String>,
    pub bundle: Arc<CertBundle>,
}

#[derive(Clone)]
struct OrderSlot {
    state: Arc<watch::Sender<OrderSnapshot>>,
    owners: Arc<Mutex<Vec<String>>>,
}

impl OrderSlot {
    fn action(&self, renew_before_expiry: Duration) -> SlotAction {
        let snapshot = self.state.borrow();
        let action = match snapshot.phase {
            OrderPhase::Failed => SlotAction::Report(snapshot.error.clone().unwrap_or(AcmeError::Cancelled)),
            OrderPhase::Ready => match &snapshot.bundle {
                Some(bundle) if !bundle.needs_renewal(renew_before_expiry) => SlotAction::Join,
                _ => SlotAction::Start,
            },
            _ => SlotAction::Join,
        };
        action
    }

    fn ready_bundle(&self, renew_before_expiry: Duration) -> Option<Arc<CertBundle>> {
        let snapshot = self.state.borrow();
        let bundle = match (snapshot.phase, &snapshot.bundle) {
            (OrderPhase::Ready, Some(bundle)) if !bundle.needs_renewal(renew_before_expiry) => Some(bundle.clone()),
            _ => None,
        };
        bundle
    }

    fn add_owner(&self, owner: Option<&str>) {
        if let Some(owner) = owner {
            let mut owners = self.owners.lock().unwrap();
            if !owners.iter().any(|o| o == owner) {
                owners.push(owner.to_string());
            }
        }
    }
}

enum SlotAction {
    Start,
    Join,
    Report(AcmeError),
}

struct OrderManagerInner {
    config: OrderManagerConfig,
    transport: AcmeTransportRef,
    challenges: ChallengeRegistryRef,
    orders: Mutex<HashMap<String, OrderSlot>>,
    ready_notifier: Option<mpsc::UnboundedSender<OrderReady>>,
    shutdown: watch::Sender<bool>,
}

/// Drives one ACME order per domain set, in the background, and answers
/// repeated `order()` calls from the current state of that order.
pub struct OrderManager {
    inner: Arc<OrderManagerInner>,
}

impl OrderManager {
    pub fn new(config: OrderManagerConfig, transport: AcmeTransportRef, challenges: ChallengeRegistryRef) -> Self {
        Self::build(config, transport, challenges, None)
    }

    /// Like [`OrderManager::new`], and `notifier` receives one [`OrderReady`]
    /// per completed order.
    pub fn with_ready_notifier(
        config: OrderManagerConfig,
        transport: AcmeTransportRef,
        challenges: ChallengeRegistryRef,
        notifier: mpsc::UnboundedSender<OrderReady>,
    ) -> Self {
        Self::build(config, transport, challenges, Some(notifier))
    }

    fn build(
        config: OrderManagerConfig,
        transport: AcmeTransportRef,
        challenges: ChallengeRegistryRef,
        ready_notifier: Option<mpsc::UnboundedSender<OrderReady>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(OrderManagerInner {
                config,
                transport,
                challenges,
                orders: Mutex::new(HashMap::new()),
                ready_notifier,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &OrderManagerConfig {
        &self.inner.config
    }

    /// Returns the certificate for `domains` if one is ready and not due for
    /// renewal, otherwise the challenge URLs of the order in flight, starting
    /// that order when there is none. Never waits for validation; a new order
    /// is waited on for at most `start_wait` so its challenge URLs can be
    /// returned. A failed attempt is reported once, and the next call starts
    /// over.
    pub async fn order<S: AsRef<str>>(&self, domains: &[S], owner: Option<&str>) -> AcmeResult<OrderOutcome> {
        let domains = DomainSet::new(domains)?;
        let key = domains.key();

        let state = {
            let mut orders = self.inner.orders.lock().unwrap();
            if *self.inner.shutdown.borrow() {
                let renew_before_expiry = self.inner.config.renew_before_expiry;
                return match orders.get(&key).and_then(|slot| slot.ready_bundle(renew_before_expiry)) {
                    Some(bundle) => Ok(OrderOutcome {
                        challenge_urls: vec![],
                        bundle: Some(bundle),
                    }),
                    None => Err(AcmeError::Cancelled),
                };
            }

            let action = match orders.get(&key) {
                None => SlotAction::Start,
                Some(slot) => slot.action(self.inner.config.renew_before_expiry),
            };

            match action {
                SlotAction::Report(e) => {
                    orders.remove(&key);
                    return Err(e);
                }
                SlotAction::Join => {
                    let slot = &orders[&key];
                    slot.add_owner(owner);
                    slot.state.clone()
                }
                SlotAction::Start => {
                    let slot = self.start_order(domains.clone(), owner);
                    let state = slot.state.clone();
                    orders.insert(key.clone(), slot);
                    state
                }
            }
        };

        let mut rx = state.subscribe();
        let _ = tokio::time::timeout(
            self.inner.config.start_wait,
            rx.wait_for(|s| s.phase != OrderPhase::Pending),
        )
        .await;

        let snapshot = rx.borrow().clone();
        match snapshot.phase {
            OrderPhase::Ready => Ok(OrderOutcome {
                challenge_urls: vec![],
                bundle: snapshot.bundle,
            }),
            OrderPhase::Failed => {
                let mut orders = self.inner.orders.lock().unwrap();
                if orders.get(&key).is_some_and(|slot| Arc::ptr_eq(&slot.state, &state)) {
                    orders.remove(&key);
                }
                Err(snapshot.error.unwrap_or(AcmeError::Cancelled))
            }
            _ => Ok(OrderOutcome {
                challenge_urls: snapshot.challenge_urls,
                bundle: None,
            }),
        }
    }

    pub fn phase<S: AsRef<str>>(&self, domains: &[S]) -> Option<OrderPhase> {
        let key = DomainSet::new(domains).ok()?.key();
        let orders = self.inner.orders.lock().unwrap();
        orders.get(&key).map(|slot| slot.state.borrow().phase)
    }

    /// Cancels every order in flight. Each one removes its challenges and
    /// ends as `Failed` with [`AcmeError::Cancelled`]. Afterwards `order()`
    /// still hands out certificates that are ready and not due for renewal,
    /// and fails with `Cancelled` for everything else.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("order manager shutdown");
        }
    }

    fn start_order(&self, domains: DomainSet, owner: Option<&str>) -> OrderSlot {
        info!("start order for {}", domains);
        let (state, _) = watch::channel(OrderSnapshot::pending());
        let slot = OrderSlot {
            state: Arc::new(state),
            owners: Arc::new(Mutex::new(vec![])),
        };
        slot.add_owner(owner);

        tokio::spawn(run_order(self.inner.clone(), domains, slot.clone()));
        slot
    }
}

impl Drop for OrderManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_order(inner: Arc<OrderManagerInner>, domains: DomainSet, slot: OrderSlot) {
    let session = OrderSession {
        inner: inner.clone(),
        domains: domains.clone(),
        state: slot.state.clone(),
        registered: vec![],
    };

    let order_timeout = inner.config.order_timeout;
    let mut shutdown = inner.shutdown.subscribe();
    let result = tokio::select! {
        ret = tokio::time::timeout(order_timeout, session.run()) => match ret {
            Ok(ret) => ret,
            Err(_) => Err(AcmeError::Timeout(format!("order for {} not ready after {:?}", domains, order_timeout))),
        },
        _ = shutdown.wait_for(|stop| *stop) => Err(AcmeError::Cancelled),
    };

    match result {
        Ok(bundle) => {
            let bundle = Arc::new(bundle);
            let owners = slot.owners.lock().unwrap().clone();
            info!("order for {} ready, not after {}", domains, bundle.not_after());
            slot.state.send_modify(|s| {
                s.phase = OrderPhase::Ready;
                s.challenge_urls.clear();
                s.bundle = Some(bundle.clone());
                s.error = None;
            });

            if let Some(notifier) = &inner.ready_notifier {
                let ready = OrderReady {
                    domains,
                    owners,
                    bundle,
                };
                if notifier.send(ready).is_err() {
                    warn!("order ready notifier closed");
                }
            }
        }
        Err(e) => {
            error!("order for {} failed, {}", domains, e);
            slot.state.send_modify(|s| {
                s.phase = OrderPhase::Failed;
                s.challenge_urls.clear();
                s.bundle = None;
                s.error = Some(e);
            });
        }
    }
}

/// One attempt at an order. Challenges it registered are removed when it is
/// dropped, whether it finished, failed, timed out or was cancelled.
struct OrderSession {
    inner: Arc<OrderManagerInner>,
    domains: DomainSet,
    state: Arc<watch::Sender<OrderSnapshot>>,
    registered: Vec<String>,
}

impl Display for OrderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderSession(domains: {})", self.domains)
    }
}

impl OrderSession {
    async fn run(mut self) -> AcmeResult<CertBundle> {
        let inner = self.inner.clone();
        let config = &inner.config;
        let transport = inner.transport.as_ref();
        let names = self.domains.to_vec();
        let names = names.as_slice();

        with_retry(&config.retry, "ensure account", move || transport.ensure_account()).await?;
        let order = with_retry(&config.retry, "new order", move || transport.new_order(names)).await?;
        info!("{} created order {}", self, order.url);

        let mut challenge_urls = vec![];
        let mut to_validate = vec![];
        for authz_url in order.authorizations.iter() {
            let authz_url = authz_url.as_str();
            let authz =
                with_retry(&config.retry, "get authorization", move || transport.get_authorization(authz_url)).await?;
            let identifier = authz.identifier.value.clone();
            if authz.status == AcmeStatus::Valid {
                debug!("{} authorization for {} already valid", self, identifier);
                continue;
            }
            if authz.status.is_rejected() {
                return Err(AcmeError::ValidationRejected(format!("{} is {:?}", identifier, authz.status)));
            }

            let challenge = authz
                .http01_challenge()
                .ok_or_else(|| AcmeError::Protocol(format!("no http-01 challenge for {}", identifier)))?;
            if challenge.token.is_empty() {
                return Err(AcmeError::Protocol(format!("empty challenge token for {}", identifier)));
            }

            let key_auth = transport.key_authorization(&challenge.token)?;
            let path = challenge_path(&challenge.token);
            let url = Url::parse(&format!("http://{}{}", identifier, path))
                .map_err(|e| AcmeError::Protocol(format!("bad challenge url for {}, {}", identifier, e)))?;

            self.inner.challenges.register_challenge(&path, &key_auth);
            self.registered.push(path);
            challenge_urls.push(url);
            to_validate.push((authz_url.to_string(), challenge.url.clone()));
        }

        info!("{} validating, challenges: {:?}", self, challenge_urls);
        self.state.send_modify(|s| {
            s.phase = OrderPhase::Validating;
            s.challenge_urls = challenge_urls;
        });

        for (_, challenge_url) in to_validate.iter() {
            let challenge_url = challenge_url.as_str();
            with_retry(&config.retry, "trigger challenge", move || transport.trigger_challenge(challenge_url))
                .await?;
        }
        for (authz_url, _) in to_validate.iter() {
            wait_authorization(transport, &config.authorization_poll, authz_url).await?;
        }

        info!("{} validated, finalizing", self);
        self.state.send_modify(|s| s.phase = OrderPhase::Finalizing);

        let order = poll_order(
            transport,
            &config.finalize_poll,
            &order.url,
            &[AcmeStatus::Ready, AcmeStatus::Processing, AcmeStatus::Valid],
        )
        .await?;

        let (csr, key_pem) = generate_csr(names, config.key_type)?;
        let order = if order.status == AcmeStatus::Ready {
            let order = &order;
            let csr = csr.as_slice();
            with_retry(&config.retry, "finalize order", move || transport.finalize_order(order, csr)).await?
        } else {
            order
        };
        let order = if order.status == AcmeStatus::Valid {
            order
        } else {
            poll_order(transport, &config.finalize_poll, &order.url, &[AcmeStatus::Valid]).await?
        };

        let cert_url = order
            .certificate
            .as_deref()
            .ok_or_else(|| AcmeError::Protocol(format!("order {} valid without certificate", order.url)))?;
        let chain =
            with_retry(&config.retry, "download certificate", move || transport.download_certificate(cert_url)).await?;
        self.release_challenges();

        let bundle = CertBundle::from_pem(&chain, &key_pem)?;
        if let Some(missing) = self.domains.iter().find(|d| !bundle.dns_names().contains(*d)) {
            return Err(AcmeError::Certificate(format!("issued certificate does not cover {}", missing)));
        }
        Ok(bundle)
    }

    fn release_challenges(&mut self) {
        for path in self.registered.drain(..) {
            debug!("unregister challenge {}", path);
            self.inner.challenges.unregister_challenge(&path);
        }
    }
}

impl Drop for OrderSession {
    fn drop(&mut self) {
        self.release_challenges();
    }
}

async fn wait_authorization(transport: &dyn AcmeTransport, policy: &RetryPolicy, url: &str) -> AcmeResult<()> {
    let max_attempts = attempts(policy);
    let mut backoff = Backoff::new(policy);
    for attempt in 1..=max_attempts {
        match transport.get_authorization(url).await {
            Ok(authz) if authz.status == AcmeStatus::Valid => {
                info!("authorization {} for {} valid", url, authz.identifier.value);
                return Ok(());
            }
            Ok(authz) if authz.status.is_rejected() => {
                let reason = authz.problem().map(|p| p.to_string()).unwrap_or_default();
                return Err(AcmeError::ValidationRejected(format!(
                    "{} is {:?} {}",
                    authz.identifier.value, authz.status, reason
                )));
            }
            Ok(authz) => debug!("authorization {} is {:?}, attempt {}", url, authz.status, attempt),
            Err(e) if e.is_retriable() => warn!("poll authorization {} failed, attempt {}, {}", url, attempt, e),
            Err(e) => return Err(e),
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    Err(AcmeError::Timeout(format!("authorization {} not valid after {} polls", url, max_attempts)))
}

/// Polls the order until it reaches one of `until`. An invalid order fails.
async fn poll_order(
    transport: &dyn AcmeTransport,
    policy: &RetryPolicy,
    url: &str,
    until: &[AcmeStatus],
) -> AcmeResult<AcmeOrder> {
    let max_attempts = attempts(policy);
    let mut backoff = Backoff::new(policy);
    for attempt in 1..=max_attempts {
        match transport.get_order(url).await {
            Ok(order) if until.contains(&order.status) => return Ok(order),
            Ok(order) if order.status == AcmeStatus::Invalid => {
                let reason = order.error.map(|p| p.to_string()).unwrap_or_default();
                return Err(AcmeError::FinalizeRejected(format!("order {} invalid {}", url, reason)));
            }
            Ok(order) => debug!("order {} is {:?}, attempt {}", url, order.status, attempt),
            Err(e) if e.is_retriable() => warn!("poll order {} failed, attempt {}, {}", url, attempt, e),
            Err(e) => return Err(e),
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    Err(AcmeError::Timeout(format!("order {} not {:?} after {} polls", url, until, max_attempts)))
}
