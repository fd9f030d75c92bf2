// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Task-Local Context Holder
//!
//! Carries the [`RequestContext`] across the suspension points of one run.
//! The holder is a tokio task-local rather than an OS thread-local: worker
//! threads migrate items freely, so the context must follow the task, not the
//! thread. The orchestrator installs the context around the whole drive of a
//! run; the engine re-installs it around user invocations dispatched to their
//! own tasks.
//!
//! Steps read the ambient context through [`current`]/[`try_current`], e.g.
//! to observe the replay flag or the version tag.

use std::future::Future;
use std::sync::Arc;

use stepflow_domain::RequestContext;

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<RequestContext>;
}

/// Runs `future` with `context` installed as the ambient request context.
pub async fn scope<F: Future>(context: Arc<RequestContext>, future: F) -> F::Output {
    CURRENT_CONTEXT.scope(context, future).await
}

/// The ambient request context, if one is installed on this task.
pub fn try_current() -> Option<Arc<RequestContext>> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}

/// The ambient request context; falls back to a detached context when called
/// outside a managed run (unit tests, ad-hoc step invocations).
pub fn current() -> Arc<RequestContext> {
    try_current().unwrap_or_else(|| Arc::new(RequestContext::new(stepflow_domain::RunControls::detached())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_domain::{RequestHeaders, RunControls};

    #[tokio::test]
    async fn test_scope_installs_context() {
        let headers = RequestHeaders::new().with("version", "v7");
        let (ctx, _) = RequestContext::from_headers(&headers, RunControls::detached());
        let ctx = Arc::new(ctx);

        let seen = scope(Arc::clone(&ctx), async { try_current().unwrap().version_tag().map(String::from) }).await;
        assert_eq!(seen.as_deref(), Some("v7"));
    }

    #[tokio::test]
    async fn test_context_survives_suspension() {
        let ctx = Arc::new(RequestContext::new(RunControls::detached()));
        let run_id = ctx.run_id();

        let seen = scope(ctx, async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            try_current().unwrap().run_id()
        })
        .await;
        assert_eq!(seen, run_id);
    }

    #[tokio::test]
    async fn test_no_context_outside_scope() {
        assert!(try_current().is_none());
    }
}
