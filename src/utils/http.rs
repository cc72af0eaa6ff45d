use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Image generation routinely takes over a minute; per-call limits are applied by the orchestrator.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(300))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
