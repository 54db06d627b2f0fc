use std::future::Future;
use std::time::Duration;

pub async fn sleep(d: Duration) {
    tokio::time::sleep(d).await;
}

pub fn spawn(f: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(f);
}
