use std::error::Error;

use basalt_sdk::session::{Principal, SessionOptions, SessionStore};
use basalt_sdk::transport::AuthTransport;
use reqwest::Method;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://127.0.0.1:8090".to_string();
    let email = "REPLACE_WITH_ADMIN_EMAIL".to_string();
    let password = "REPLACE_WITH_ADMIN_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = SessionStore::with_password_auth(&base_url, SessionOptions::default())?;
        let token = session
            .authenticate(Principal::admin(email, SecretString::new(password)))
            .await?;
        println!("authenticated, token length {}", token.len());

        let transport = AuthTransport::new(&base_url, session.clone())?;
        let response = transport
            .request(Method::GET, "/api/collections/posts/records")
            .await?
            .send()
            .await?;
        println!("listed posts with status {}", response.status());

        session.clear();
        println!(
            "session cleared, authenticated={}",
            session.is_authenticated()
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
