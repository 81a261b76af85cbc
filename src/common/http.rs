use std::time::Duration;

use reqwest::{Client, Error};

const USER_AGENT: &str = concat!("partyline/", env!("CARGO_PKG_VERSION"));

pub struct HttpClient;

impl HttpClient {
    /// Client with a hard request deadline so credential fetches never hang.
    pub fn with_timeout(timeout: Duration) -> Result<Client, Error> {
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
    }
}
