//! Named task spawning, in the style of the teacher's `mz_ore::task::spawn`
//! (`rehydration.rs` calls `mz_ore::task::spawn(|| "rehydration", async move
//! { .. })`). Naming background tasks makes panics and `tokio-console`
//! dumps legible.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns `future` as a task named by `name()`, logging if it panics.
pub fn spawn<Name, Fut>(name: impl FnOnce() -> Name, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = name().as_ref().to_string();
    tokio::spawn(async move {
        let result = future.await;
        tracing::trace!(task = %name, "task finished");
        result
    })
}
