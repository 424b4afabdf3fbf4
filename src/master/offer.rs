//! The offer ledger: every outstanding offer and inverse offer, with
//! their expiration timers.
//!
//! An offer exists iff it is in this ledger and in exactly one
//! framework's and one agent's offer sets. The master's
//! `remove_offer`/`remove_inverse_offer` helpers are the only paths out
//! of all three places.

use crate::ids::OfferId;
use crate::messages::scheduler::{InverseOffer, Offer};
use std::collections::HashMap;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct OfferLedger {
    offers: HashMap<OfferId, Offer>,
    timers: HashMap<OfferId, JoinHandle<()>>,

    inverse_offers: HashMap<OfferId, InverseOffer>,
    inverse_timers: HashMap<OfferId, JoinHandle<()>>,
}

impl OfferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an offer, optionally with its expiration timer handle.
    pub fn insert(&mut self, offer: Offer, timer: Option<JoinHandle<()>>) {
        if let Some(timer) = timer {
            self.timers.insert(offer.offer_id.clone(), timer);
        }
        self.offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn get(&self, offer_id: &OfferId) -> Option<&Offer> {
        self.offers.get(offer_id)
    }

    pub fn contains(&self, offer_id: &OfferId) -> bool {
        self.offers.contains_key(offer_id)
    }

    /// Remove an offer, disarming its timer. Whoever removes the offer
    /// first wins any race with expiry.
    pub fn take(&mut self, offer_id: &OfferId) -> Option<Offer> {
        if let Some(timer) = self.timers.remove(offer_id) {
            timer.abort();
        }
        self.offers.remove(offer_id)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }

    pub fn insert_inverse(&mut self, offer: InverseOffer, timer: Option<JoinHandle<()>>) {
        if let Some(timer) = timer {
            self.inverse_timers.insert(offer.offer_id.clone(), timer);
        }
        self.inverse_offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn get_inverse(&self, offer_id: &OfferId) -> Option<&InverseOffer> {
        self.inverse_offers.get(offer_id)
    }

    pub fn take_inverse(&mut self, offer_id: &OfferId) -> Option<InverseOffer> {
        if let Some(timer) = self.inverse_timers.remove(offer_id) {
            timer.abort();
        }
        self.inverse_offers.remove(offer_id)
    }
}

impl Drop for OfferLedger {
    fn drop(&mut self) {
        for timer in self.timers.values().chain(self.inverse_timers.values()) {
            timer.abort();
        }
    }
}
