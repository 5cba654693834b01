//! Pagination coordinator: decides when the next history page is requested.
//!
//! `current_page` counts pages that have landed. A request is described by a
//! [`FetchTicket`]; at most one ticket is outstanding, and a result is only
//! applied when it answers that exact ticket.

use tracing::debug;

/// An issued history request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    pub page: u32,
    pub limit: u32,
    generation: u64,
}

#[derive(Debug)]
pub struct PaginationCoordinator {
    page_size: u32,
    current_page: u32,
    total_count: Option<u64>,
    in_flight: Option<FetchTicket>,
    armed: bool,
    generation: u64,
    last_error: Option<String>,
}

impl PaginationCoordinator {
    /// `reversed` feeds (chat) stay disarmed until the consumer scrolls away
    /// from the initial anchor.
    pub fn new(page_size: u32, reversed: bool) -> Self {
        Self {
            page_size: page_size.max(1),
            current_page: 0,
            total_count: None,
            in_flight: None,
            armed: !reversed,
            generation: 0,
            last_error: None,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pages merged so far.
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    /// `current_page * page_size < total`. False until the first page lands.
    pub fn has_more(&self) -> bool {
        match self.total_count {
            Some(total) => u64::from(self.current_page) * u64::from(self.page_size) < total,
            None => false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Request page 1 when nothing has loaded yet and nothing is pending.
    pub fn initial_fetch(&mut self) -> Option<FetchTicket> {
        if self.current_page > 0 || self.in_flight.is_some() {
            return None;
        }
        Some(self.issue(1))
    }

    /// The sentinel became visible.
    ///
    /// Issues the next page only when armed, when nothing is in flight, and
    /// when the server reported more events than have been loaded.
    pub fn on_sentinel_visible(&mut self) -> Option<FetchTicket> {
        if !self.armed || self.in_flight.is_some() {
            return None;
        }
        if self.total_count.is_some() && !self.has_more() {
            return None;
        }
        Some(self.issue(self.current_page + 1))
    }

    /// The consumer's scroll position moved; `offset` is the distance from the
    /// initial anchor. Once moved away the coordinator stays armed.
    pub fn on_scroll(&mut self, offset: f64) {
        if !self.armed && offset.abs() > f64::EPSILON {
            debug!(offset, "pagination armed");
            self.armed = true;
        }
    }

    /// Re-issue the page whose fetch failed, ignoring the scroll gate.
    pub fn retry(&mut self) -> Option<FetchTicket> {
        if self.in_flight.is_some() || self.last_error.is_none() {
            return None;
        }
        Some(self.issue(self.current_page + 1))
    }

    /// Record a successful fetch. Returns `false` for stale tickets, whose
    /// pages must not be merged.
    pub fn complete(&mut self, ticket: FetchTicket, total: u64) -> bool {
        if self.in_flight != Some(ticket) {
            debug!(page = ticket.page, "ignoring stale page");
            return false;
        }
        self.in_flight = None;
        self.current_page = ticket.page;
        self.total_count = Some(total);
        self.last_error = None;
        true
    }

    /// Record a failed fetch. The page counter does not move.
    pub fn fail(&mut self, ticket: FetchTicket, error: impl Into<String>) -> bool {
        if self.in_flight != Some(ticket) {
            return false;
        }
        self.in_flight = None;
        self.last_error = Some(error.into());
        true
    }

    /// Start over from page 1 after an invalidation. Any outstanding ticket
    /// becomes stale.
    pub fn reset(&mut self) -> FetchTicket {
        self.generation += 1;
        self.current_page = 0;
        self.total_count = None;
        self.in_flight = None;
        self.last_error = None;
        self.issue(1)
    }

    fn issue(&mut self, page: u32) -> FetchTicket {
        let ticket = FetchTicket {
            page,
            limit: self.page_size,
            generation: self.generation,
        };
        self.in_flight = Some(ticket);
        ticket
    }
}
