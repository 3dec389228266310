use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::models::FlightDetail;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;

/// Where the fleet store gets its data from.
pub trait FlightSource: Send + Sync {
    /// The raw flight list: a JSON array of feed entries.
    fn fetch_flights(&self) -> impl Future<Output = Result<String, FeedError>> + Send;

    /// Full metadata and history for one flight.
    fn fetch_detail(
        &self,
        flight_id: &str,
    ) -> impl Future<Output = Result<FlightDetail, FeedError>> + Send;
}

pub struct FlightProvider {
    client: Client,
    flights_url: String,
    detail_url: String,
}

impl FlightProvider {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_seconds))
                .build()?,
            flights_url: config.flights_url.clone(),
            detail_url: config.flight_detail_url.clone(),
        })
    }

    fn detail_url_for(&self, flight_id: &str) -> String {
        self.detail_url.replace("{id}", flight_id)
    }
}

impl FlightSource for FlightProvider {
    async fn fetch_flights(&self) -> Result<String, FeedError> {
        let res = self.client.get(&self.flights_url).send().await?;
        if !res.status().is_success() {
            return Err(FeedError::Status(res.status().as_u16()));
        }
        Ok(res.text().await?)
    }

    async fn fetch_detail(&self, flight_id: &str) -> Result<FlightDetail, FeedError> {
        let res = self.client.get(self.detail_url_for(flight_id)).send().await?;
        if !res.status().is_success() {
            return Err(FeedError::Status(res.status().as_u16()));
        }
        let body = res.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}
