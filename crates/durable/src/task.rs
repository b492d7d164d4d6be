//! Task definitions
//!
//! A task is a user workflow function with a stable id. Handlers receive the
//! durable [`TaskContext`] explicitly and use its primitives for every
//! side-effecting operation, so re-executions replay the same step sequence.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::TaskContext;
use crate::error::TaskError;

/// A durable workflow definition
///
/// The handler must be deterministic in its *shape*: every attempt re-runs it
/// from the top, and each durable operation must produce the same step id in
/// the same order. Memoized step results short-circuit completed work; the
/// first non-memoized sleep or wait suspends the attempt.
///
/// # Example
///
/// ```ignore
/// struct Onboarding;
///
/// #[async_trait]
/// impl Task for Onboarding {
///     const ID: &'static str = "onboarding";
///     type Input = SignupRequest;
///     type Output = SignupReceipt;
///
///     async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError> {
///         let account = ctx.step("create-account", || create_account(&input)).await?;
///         ctx.sleep(Duration::from_secs(60)).await?;
///         let receipt = ctx.step("send-welcome", || send_welcome(&account)).await?;
///         Ok(receipt)
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Stable task identifier
    const ID: &'static str;

    /// Input payload type
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Result type, persisted on completion
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Run one attempt of the workflow
    async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError>;
}
