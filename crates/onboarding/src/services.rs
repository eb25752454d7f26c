//! Downstream onboarding services.
//!
//! Choosing a hospital or a doctor and notifying the patient are opaque
//! external calls. [`SimulatedServices`] answers locally after a delay;
//! [`HttpServices`] calls a remote onboarding service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{OnboardingError, Result};
use crate::model::{Doctor, Hospital};

/// Default artificial latency of the simulated services.
pub const DEFAULT_SIMULATED_DELAY: Duration = Duration::from_millis(250);

/// The external calls made during onboarding.
#[async_trait]
pub trait OnboardingServices: Send + Sync {
    /// Pick a hospital serving `zip`.
    async fn assign_hospital(&self, zip: &str) -> Result<Hospital>;

    /// Pick a doctor for `condition`.
    async fn assign_doctor(&self, condition: &str) -> Result<Doctor>;

    /// Notify the patient at `contact` (an email address or phone number).
    async fn notify(&self, contact: &str) -> Result<()>;
}

/// Which services to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Remote onboarding service. Simulated services are used when unset.
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Artificial latency of the simulated services, in milliseconds.
    #[serde(default = "default_simulated_delay_ms")]
    pub simulated_delay_ms: u64,
    /// Simulated processing time after each activity, in milliseconds.
    #[serde(default)]
    pub work_delay_ms: u64,
}

fn default_simulated_delay_ms() -> u64 {
    u64::try_from(DEFAULT_SIMULATED_DELAY.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            simulated_delay_ms: default_simulated_delay_ms(),
            work_delay_ms: 0,
        }
    }
}

impl ServicesConfig {
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    #[must_use]
    pub const fn with_simulated_delay_ms(mut self, delay_ms: u64) -> Self {
        self.simulated_delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub const fn work_delay(&self) -> Duration {
        Duration::from_millis(self.work_delay_ms)
    }

    /// Build the configured services.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn build(&self) -> Result<Arc<dyn OnboardingServices>> {
        match &self.base_url {
            Some(base_url) => {
                info!(base_url = %base_url, "Using remote onboarding services");
                Ok(Arc::new(HttpServices::new(base_url.clone())?))
            }
            None => {
                info!(
                    delay_ms = self.simulated_delay_ms,
                    "Using simulated onboarding services"
                );
                Ok(Arc::new(SimulatedServices::new(Duration::from_millis(
                    self.simulated_delay_ms,
                ))))
            }
        }
    }
}

const HOSPITALS: [&str; 3] = [
    "General Hospital",
    "St. Mary's Medical Center",
    "Riverside Community Hospital",
];

/// Local stand-in for the onboarding service with deterministic answers.
#[derive(Debug, Clone, Default)]
pub struct SimulatedServices {
    delay: Duration,
}

impl SimulatedServices {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl OnboardingServices for SimulatedServices {
    async fn assign_hospital(&self, zip: &str) -> Result<Hospital> {
        if zip.trim().is_empty() {
            return Err(OnboardingError::service("assign hospital", "zip code is empty"));
        }
        self.pause().await;

        let bucket = zip
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_add(usize::from(b)))
            % HOSPITALS.len();
        let name = HOSPITALS.get(bucket).copied().unwrap_or("General Hospital");

        debug!(zip, hospital = name, "Simulated hospital assignment");
        Ok(Hospital {
            name: name.to_string(),
            zip: zip.to_string(),
        })
    }

    async fn assign_doctor(&self, condition: &str) -> Result<Doctor> {
        self.pause().await;

        let (name, specialty) = match condition.trim().to_ascii_lowercase().as_str() {
            "heart" | "cardiac" | "hypertension" => ("Dr. Chen", "Cardiology"),
            "skin" | "rash" | "eczema" => ("Dr. Okafor", "Dermatology"),
            "bones" | "fracture" | "joint" => ("Dr. Novak", "Orthopedics"),
            _ => ("Dr. Smith", "General Practice"),
        };

        debug!(condition, doctor = name, "Simulated doctor assignment");
        Ok(Doctor {
            name: name.to_string(),
            specialty: specialty.to_string(),
        })
    }

    async fn notify(&self, contact: &str) -> Result<()> {
        if contact.trim().is_empty() {
            return Err(OnboardingError::service("notify", "no contact address"));
        }
        self.pause().await;
        debug!(contact, "Simulated notification sent");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct NotificationRequest<'a> {
    contact: &'a str,
}

/// Client for a remote onboarding service.
///
/// - `GET  {base}/hospitals?zip=...` returns a [`Hospital`]
/// - `GET  {base}/doctors?condition=...` returns a [`Doctor`]
/// - `POST {base}/notifications` with `{"contact": ...}`
#[derive(Debug, Clone)]
pub struct HttpServices {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpServices {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OnboardingError::config(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| OnboardingError::config(format!("bad endpoint '{path}': {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: (&str, &str),
    ) -> Result<T> {
        let url = self.endpoint(path)?;
        self.client
            .get(url)
            .query(&[query])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OnboardingError::service(operation, e.to_string()))?
            .json::<T>()
            .await
            .map_err(|e| OnboardingError::service(operation, e.to_string()))
    }
}

#[async_trait]
impl OnboardingServices for HttpServices {
    async fn assign_hospital(&self, zip: &str) -> Result<Hospital> {
        self.get_json("assign hospital", "hospitals", ("zip", zip))
            .await
    }

    async fn assign_doctor(&self, condition: &str) -> Result<Doctor> {
        self.get_json("assign doctor", "doctors", ("condition", condition))
            .await
    }

    async fn notify(&self, contact: &str) -> Result<()> {
        let url = self.endpoint("notifications")?;
        self.client
            .post(url)
            .json(&NotificationRequest { contact })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OnboardingError::service("notify", e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_simulated_hospital_is_deterministic() {
        let services = SimulatedServices::default();
        let first = services.assign_hospital("90210").await.unwrap();
        let second = services.assign_hospital("90210").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.zip, "90210");
    }

    #[tokio::test]
    async fn test_simulated_rejects_missing_inputs() {
        let services = SimulatedServices::default();
        assert!(services.assign_hospital(" ").await.is_err());
        assert!(services.notify("").await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_doctor_by_condition() {
        let services = SimulatedServices::default();
        let doctor = services.assign_doctor("Heart").await.unwrap();
        assert_eq!(doctor.specialty, "Cardiology");
        let doctor = services.assign_doctor("flu").await.unwrap();
        assert_eq!(doctor.specialty, "General Practice");
    }

    #[test]
    fn test_config_defaults_to_simulated() {
        let config = ServicesConfig::default();
        assert!(config.base_url.is_none());
        assert_eq!(config.simulated_delay_ms, 250);
        assert!(config.build().is_ok());
    }
}
