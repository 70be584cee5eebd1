//! Outbound notification delivery.
//!
//! Two channel seams (SMS gateway, email sender) behind traits, composed by
//! `Notifier` with SMS-first delivery and email fallback. Failures of one
//! channel are logged and trigger the fallback, never silently swallowed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::error::NotifyError;

/// Delivery endpoints for one user. Minimal projection of the out-of-scope
/// account system; kept current by the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: String,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub email: Option<String>,
}

/// Per-phone consent state, flipped synchronously on inbound STOP/START.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEntry {
    pub phone: String,
    pub opted_in: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Sms,
    Email,
}

impl DeliveryChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// SMS gateway client: one POST per message, bearer-authenticated.
pub struct HttpSmsGateway {
    client: reqwest::Client,
    endpoint: Url,
    auth_token: SecretString,
    from: String,
}

impl HttpSmsGateway {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        auth_token: SecretString,
        from: String,
    ) -> Self {
        Self {
            client,
            endpoint,
            auth_token,
            from,
        }
    }
}

#[async_trait]
impl SmsSender for HttpSmsGateway {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.auth_token.expose_secret())
            .json(&json!({ "from": self.from, "to": to, "body": body }))
            .send()
            .await
            .map_err(|e| NotifyError::SmsFailed {
                to: to.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(NotifyError::SmsFailed {
                to: to.to_string(),
                reason: format!("gateway returned http {}", response.status().as_u16()),
            });
        }
        Ok(())
    }
}

/// Transactional email client.
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: Url,
    api_key: SecretString,
    from: String,
}

impl HttpEmailSender {
    pub fn new(client: reqwest::Client, endpoint: Url, api_key: SecretString, from: String) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "from": self.from,
                "to": to,
                "subject": subject,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| NotifyError::EmailFailed {
                to: to.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(NotifyError::EmailFailed {
                to: to.to_string(),
                reason: format!("sender returned http {}", response.status().as_u16()),
            });
        }
        Ok(())
    }
}

/// SMS-first delivery with email fallback.
pub struct Notifier {
    sms: Option<Arc<dyn SmsSender>>,
    email: Option<Arc<dyn EmailSender>>,
}

impl Notifier {
    pub fn new(sms: Option<Arc<dyn SmsSender>>, email: Option<Arc<dyn EmailSender>>) -> Self {
        Self { sms, email }
    }

    /// Deliver one message. SMS is used when the subscriber's phone is
    /// verified AND `sms_allowed` (the caller's consent-ledger check); any
    /// SMS failure or missing phone falls back to email.
    pub async fn deliver(
        &self,
        subscriber: &Subscriber,
        sms_allowed: bool,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryChannel, NotifyError> {
        if sms_allowed
            && subscriber.phone_verified
            && let (Some(phone), Some(sms)) = (subscriber.phone.as_deref(), self.sms.as_ref())
        {
            match sms.send_sms(phone, body).await {
                Ok(()) => return Ok(DeliveryChannel::Sms),
                Err(e) => {
                    tracing::warn!(
                        user_id = %subscriber.user_id,
                        error = %e,
                        "SMS delivery failed, falling back to email"
                    );
                }
            }
        }

        if let (Some(email), Some(sender)) = (subscriber.email.as_deref(), self.email.as_ref()) {
            sender.send_email(email, subject, body).await?;
            return Ok(DeliveryChannel::Email);
        }

        Err(NotifyError::NoChannel {
            user_id: subscriber.user_id.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records sends; fails when `fail` is set.
    #[derive(Default)]
    pub struct RecordingSms {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl SmsSender for RecordingSms {
        async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::SmsFailed {
                    to: to.to_string(),
                    reason: "simulated outage".to_string(),
                });
            }
            self.sent
                .lock()
                .expect("lock")
                .push((to.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingEmail {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl EmailSender for RecordingEmail {
        async fn send_email(&self, to: &str, subject: &str, _body: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::EmailFailed {
                    to: to.to_string(),
                    reason: "simulated outage".to_string(),
                });
            }
            self.sent
                .lock()
                .expect("lock")
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{RecordingEmail, RecordingSms};
    use super::*;

    fn subscriber(phone_verified: bool) -> Subscriber {
        Subscriber {
            user_id: "u1".to_string(),
            phone: Some("+15555550100".to_string()),
            phone_verified,
            email: Some("parent@example.com".to_string()),
        }
    }

    fn notifier_of(
        sms: &Arc<RecordingSms>,
        email: &Arc<RecordingEmail>,
    ) -> Notifier {
        Notifier::new(
            Some(sms.clone() as Arc<dyn SmsSender>),
            Some(email.clone() as Arc<dyn EmailSender>),
        )
    }

    #[tokio::test]
    async fn prefers_sms_for_verified_phone() {
        let sms = Arc::new(RecordingSms::default());
        let email = Arc::new(RecordingEmail::default());
        let notifier = notifier_of(&sms, &email);

        let channel = notifier
            .deliver(&subscriber(true), true, "subject", "body")
            .await
            .expect("delivers");

        assert_eq!(channel, DeliveryChannel::Sms);
        assert_eq!(sms.sent.lock().expect("lock").len(), 1);
        assert!(email.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unverified_phone_goes_straight_to_email() {
        let sms = Arc::new(RecordingSms::default());
        let email = Arc::new(RecordingEmail::default());
        let notifier = notifier_of(&sms, &email);

        let channel = notifier
            .deliver(&subscriber(false), true, "subject", "body")
            .await
            .expect("delivers");

        assert_eq!(channel, DeliveryChannel::Email);
        assert!(sms.sent.lock().expect("lock").is_empty());
        assert_eq!(email.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn sms_failure_falls_back_to_email() {
        let sms = Arc::new(RecordingSms {
            fail: true,
            ..Default::default()
        });
        let email = Arc::new(RecordingEmail::default());
        let notifier = notifier_of(&sms, &email);

        let channel = notifier
            .deliver(&subscriber(true), true, "subject", "body")
            .await
            .expect("delivers");

        assert_eq!(channel, DeliveryChannel::Email);
        assert_eq!(email.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn consent_gate_skips_sms() {
        let sms = Arc::new(RecordingSms::default());
        let email = Arc::new(RecordingEmail::default());
        let notifier = notifier_of(&sms, &email);

        let channel = notifier
            .deliver(&subscriber(true), false, "subject", "body")
            .await
            .expect("delivers");

        assert_eq!(channel, DeliveryChannel::Email);
        assert!(sms.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn no_channel_is_an_error() {
        let notifier = Notifier::new(None, None);
        let err = notifier
            .deliver(&subscriber(true), true, "subject", "body")
            .await
            .expect_err("no channel");
        assert!(matches!(err, NotifyError::NoChannel { .. }));
    }
}
