//! Outbound integrations: SMS provider, payment gateway and document files.

pub mod documents;
pub mod payments;
pub mod sms;

use std::time::Duration;

pub(crate) const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(OUTBOUND_TIMEOUT).build()
}
