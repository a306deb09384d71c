//! Contexts handed to registration callbacks

use crate::event::Responder;
use crate::registration::RegId;
use crate::transaction::Scratch;
use databus_common::{KeyPath, Payload, QueryId, TransactionId};
use databus_protocol::{Phase, ResultRow, XactOrigin};

/// Context for a prepare callback
///
/// Rows added here are sent with the callback's return status. A callback
/// that returns `Async` keeps a clone of the responder and answers later.
pub struct PrepareContext<'a> {
    xact: TransactionId,
    reg: RegId,
    query: QueryId,
    responder: Responder,
    rows: Vec<ResultRow>,
    scratch: Option<&'a mut Scratch>,
}

impl<'a> PrepareContext<'a> {
    pub(crate) fn new(
        xact: TransactionId,
        reg: RegId,
        query: QueryId,
        responder: Responder,
        scratch: Option<&'a mut Scratch>,
    ) -> Self {
        Self {
            xact,
            reg,
            query,
            responder,
            rows: Vec::new(),
            scratch,
        }
    }

    pub fn xact_id(&self) -> TransactionId {
        self.xact
    }

    pub fn reg(&self) -> RegId {
        self.reg
    }

    pub fn query_id(&self) -> QueryId {
        self.query
    }

    /// Handle for answering after the callback has returned
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    /// Add a row keyed in the registration's own key space
    pub fn add_row(&mut self, key: KeyPath, payload: Payload) {
        self.rows.push(ResultRow::new(key, payload));
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Group scratch for grouped registrations
    pub fn scratch(&mut self) -> Option<&mut Scratch> {
        self.scratch.as_deref_mut()
    }

    /// Group scratch downcast to its concrete type
    pub fn scratch_as<T: 'static>(&mut self) -> Option<&mut T> {
        self.scratch.as_deref_mut()?.downcast_mut::<T>()
    }

    pub(crate) fn into_rows(self) -> Vec<ResultRow> {
        self.rows
    }
}

/// Context for precommit, commit and abort callbacks
pub struct PhaseContext<'a> {
    pub xact: TransactionId,
    pub reg: RegId,
    pub phase: Phase,
    pub origin: &'a XactOrigin,
}
