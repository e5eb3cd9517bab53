// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::context::{self, Context};
use crate::pipeline::{Proxy, ProxyFuture, Request};

/// Wraps `next` so every call made under a transaction is timed as a segment named
/// `segment_name`.
///
/// Without a transaction in the context the call goes straight to `next` and its future is
/// returned as is. With one, the segment is ended exactly once however the call finishes:
/// on completion, or when the future is dropped early or unwinds.
pub fn wrap(segment_name: impl Into<Arc<str>>, next: Proxy) -> Proxy {
    let segment_name: Arc<str> = segment_name.into();
    Arc::new(move |ctx: Context, req: Request| -> ProxyFuture {
        let Some(txn) = context::retrieve(&ctx) else {
            return next(ctx, req);
        };

        let segment = txn.start_segment(&segment_name);
        let response = next(ctx, req);
        Box::pin(async move {
            let result = response.await;
            segment.end();
            result
        })
    })
}
