//! Simulated auth client.
//!
//! Stands in for the remote service: logins take a moment, fail at a
//! configurable rate with retryable codes, and established sessions drop now
//! and then. Useful for exercising the lifecycle without an account.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keeper_session::{AuthClient, ClientError, ClientEvent, FailureCode, LogOnDetails, WebSessionToken};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const CODE_ALPHABET: &[u8] = b"23456789BCDFGHJKMNPQRTVWXY";
const CODE_PERIOD_SECS: i64 = 30;

/// Codes a simulated login or link failure is drawn from
const SIMULATED_FAILURES: &[FailureCode] = &[
    FailureCode::Timeout,
    FailureCode::ServiceUnavailable,
    FailureCode::NoConnection,
    FailureCode::RateLimitExceeded,
];

/// In-process [`AuthClient`] with random failure injection
#[derive(Debug)]
pub struct SimulatedAuthClient {
    events: mpsc::Sender<ClientEvent>,
    failure_rate: f64,
    link: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedAuthClient {
    /// Create a client that fails logins and drops links with probability `failure_rate`
    pub fn new(events: mpsc::Sender<ClientEvent>, failure_rate: f64) -> Self {
        Self {
            events,
            failure_rate: if failure_rate.is_finite() { failure_rate.clamp(0.0, 1.0) } else { 0.0 },
            link: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
        if let Ok(mut guard) = slot.lock() {
            if let Some(previous) = guard.take() {
                previous.abort();
            }
            *guard = task;
        }
    }

    fn random_failure() -> FailureCode {
        let mut rng = rand::thread_rng();
        SIMULATED_FAILURES[rng.gen_range(0..SIMULATED_FAILURES.len())]
    }

    fn random_token() -> WebSessionToken {
        let mut rng = rand::thread_rng();
        let session_id = format!("{:024x}", rng.gen::<u128>() >> 32);
        WebSessionToken {
            cookies: vec![
                format!("sessionid={}", session_id),
                format!("loginsecure={:032x}", rng.gen::<u128>()),
            ],
            session_id,
        }
    }

    /// Keep the link up, refresh the web session, and drop at random
    fn spawn_link(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let failure_rate = self.failure_rate;

        tokio::spawn(async move {
            loop {
                let (wait, drop_link) = {
                    let mut rng = rand::thread_rng();
                    (
                        Duration::from_secs(rng.gen_range(30..180)),
                        rng.gen_bool(failure_rate),
                    )
                };
                tokio::time::sleep(wait).await;

                let event = if drop_link {
                    ClientEvent::Disconnected {
                        code: Self::random_failure(),
                        message: "simulated connection drop".to_string(),
                    }
                } else {
                    ClientEvent::WebSession {
                        token: Self::random_token(),
                    }
                };
                let dropped = matches!(event, ClientEvent::Disconnected { .. });

                if events.send(event).await.is_err() || dropped {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl AuthClient for SimulatedAuthClient {
    fn auth_code(&self, shared_secret: &str) -> Result<String, ClientError> {
        if shared_secret.trim().is_empty() {
            return Err(ClientError::AuthCode("shared secret is empty".to_string()));
        }

        let window = chrono::Utc::now().timestamp() / CODE_PERIOD_SECS;
        let mut hasher = DefaultHasher::new();
        shared_secret.hash(&mut hasher);
        window.hash(&mut hasher);
        let mut value = hasher.finish();

        let code = (0..5)
            .map(|_| {
                let c = CODE_ALPHABET[(value % CODE_ALPHABET.len() as u64) as usize];
                value /= CODE_ALPHABET.len() as u64;
                c as char
            })
            .collect();
        Ok(code)
    }

    async fn log_on(&self, details: LogOnDetails) -> Result<(), ClientError> {
        if details.account_name.is_empty() {
            return Err(ClientError::Rejected {
                code: FailureCode::MalformedCredentials,
                message: "empty account name".to_string(),
            });
        }

        let (latency, fail) = {
            let mut rng = rand::thread_rng();
            (Duration::from_millis(rng.gen_range(200..800)), rng.gen_bool(self.failure_rate))
        };
        debug!("Simulated login for {} in {:?}", details.account_name, latency);

        let events = self.events.clone();
        let account = details.account_name;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let outcome = if fail {
                vec![ClientEvent::Error {
                    code: Self::random_failure(),
                    message: "simulated login failure".to_string(),
                }]
            } else {
                info!("Simulated service accepted login for {}", account);
                vec![
                    ClientEvent::LoggedOn,
                    ClientEvent::WebSession {
                        token: Self::random_token(),
                    },
                ]
            };
            for event in outcome {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn log_off(&self) -> Result<(), ClientError> {
        Self::replace_task(&self.link, None);
        Self::replace_task(&self.poller, None);
        info!("Simulated client logged off");
        Ok(())
    }

    async fn announce_online(&self) -> Result<(), ClientError> {
        info!(persona = "online", "Simulated client announced online presence");
        Ok(())
    }

    async fn start_confirmation_polling(
        &self,
        interval: Duration,
        identity_secret: &str,
    ) -> Result<(), ClientError> {
        if identity_secret.trim().is_empty() {
            return Err(ClientError::AuthCode("identity secret is empty".to_string()));
        }

        Self::replace_task(&self.link, Some(self.spawn_link()));

        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut checks: u64 = 0;
            loop {
                ticker.tick().await;
                checks += 1;
                debug!(checks, "Checked trade confirmations");
            }
        });
        Self::replace_task(&self.poller, Some(poller));
        Ok(())
    }
}
