use std::error::Error;

use basalt_sdk::realtime::client::RealtimeClient;
use basalt_sdk::session::{Principal, SessionOptions, SessionStore};
use basalt_sdk::transport::AuthTransport;
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
        session
            .authenticate(Principal::admin(email, SecretString::new(password)))
            .await?;

        let transport = AuthTransport::new(&base_url, session)?;
        let realtime = RealtimeClient::new(transport);

        let subscription = realtime
            .subscribe(["posts"], |event| match event {
                Ok(event) => println!("{} {}", event.action, event.record),
                Err(err) => eprintln!("stream error: {err}"),
            })
            .await?;
        println!(
            "subscribed as {} to {:?}, press ctrl-c to stop",
            subscription.client_id(),
            subscription.topics(),
        );

        tokio::signal::ctrl_c().await?;
        subscription.unsubscribe().await;
        println!("unsubscribed");

        Ok::<(), Box<dyn Error>>(())
    })
}
