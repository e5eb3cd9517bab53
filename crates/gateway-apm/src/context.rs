// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request-scoped context and the transaction slot inside it.
//!
//! The transaction is stored under a private type in a typed extension map, so the slot
//! cannot be read or overwritten by anything outside this module and holds at most one
//! transaction. An inbound `http::Request` carries the same slot in its extensions, which
//! is how the router hands the transaction to the pipeline.

use http::Extensions;

use crate::agent::Transaction;

/// Request-scoped values threaded through every pipeline stage.
///
/// Deriving a context copies the parent's values; the parent is never modified.
#[derive(Clone, Debug, Default)]
pub struct Context {
    extensions: Extensions,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context of an inbound request, carrying whatever the router attached to it.
    pub fn from_request<B>(request: &http::Request<B>) -> Self {
        Self {
            extensions: request.extensions().clone(),
        }
    }

    #[must_use]
    pub fn with_value<T: Clone + Send + Sync + 'static>(&self, value: T) -> Self {
        let mut extensions = self.extensions.clone();
        extensions.insert(value);
        Self { extensions }
    }

    pub fn value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

/// Anything that carries request-scoped extensions.
pub trait Carrier {
    fn extensions(&self) -> &Extensions;
    fn extensions_mut(&mut self) -> &mut Extensions;
}

impl Carrier for Context {
    fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl<B> Carrier for http::Request<B> {
    fn extensions(&self) -> &Extensions {
        http::Request::extensions(self)
    }

    fn extensions_mut(&mut self) -> &mut Extensions {
        http::Request::extensions_mut(self)
    }
}

#[derive(Clone)]
struct TransactionSlot(Transaction);

/// Returns a context derived from `ctx` that carries `transaction`.
#[must_use]
pub fn attach(ctx: &Context, transaction: Transaction) -> Context {
    ctx.with_value(TransactionSlot(transaction))
}

/// Stores `transaction` in the carrier in place, replacing any previous one.
pub fn attach_to<C: Carrier + ?Sized>(carrier: &mut C, transaction: Transaction) {
    carrier
        .extensions_mut()
        .insert(TransactionSlot(transaction));
}

/// The transaction of this request, if instrumentation is active for it.
pub fn retrieve<C: Carrier + ?Sized>(carrier: &C) -> Option<Transaction> {
    carrier
        .extensions()
        .get::<TransactionSlot>()
        .map(|slot| slot.0.clone())
}
