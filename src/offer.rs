//! The two-phase commit contract underlying every match the kernel makes.
//!
//! The kernel never completes a match by popping a queue head outright. It
//! first invokes [`offer`](OfferHandle::offer) on both sides; only if both
//! accept does it proceed to [`commit`](OfferHandle::commit). A handle that
//! vetoes must leave no visible state behind, which is what lets the
//! [selector](crate::select) compose many pending operations into one
//! atomic choice.
//!
//! `offer`/`commit`/`withdraw` are always invoked while the channel's lock
//! is held, so an implementation must never try to acquire that same lock,
//! and must only touch lock-free state of its own (see [`crate::select`]).

use std::sync::Arc;

/// A capability that lets the channel kernel tentatively reserve, finalize,
/// or release a match on behalf of its owner.
pub trait OfferHandle: Send + Sync {
    /// Tentatively reserve this match. Returning `false` vetoes it; the
    /// kernel will not call `withdraw` for a veto, since nothing was
    /// reserved to release.
    fn offer(&self) -> bool;

    /// Release a prior `true` from `offer`. Must be idempotent: the handle
    /// must be safe to `offer` again afterward.
    fn withdraw(&self);

    /// Finalize a match the kernel has already reserved via `offer`. Never
    /// fails; any bookkeeping that could fail belongs in `offer`.
    fn commit(&self);
}

/// The "unconditionally accept" handle: `offer` always succeeds, `withdraw`
/// and `commit` are no-ops. This is what a `None` handle passed to
/// [`read`](crate::Channel::read)/[`write`](crate::Channel::write) is
/// internally replaced with.
pub(crate) struct NullOffer;

impl OfferHandle for NullOffer {
    fn offer(&self) -> bool {
        true
    }

    fn withdraw(&self) {}

    fn commit(&self) {}
}

/// The offer handle a caller may pass to `read`/`write` to make the
/// operation vetoable (as the [selector](crate::select) does) or to observe
/// when it commits.
pub type Offer = Arc<dyn OfferHandle>;

pub(crate) fn null_offer() -> Offer {
    Arc::new(NullOffer)
}
