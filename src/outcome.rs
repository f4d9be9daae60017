//! Outcomes: who gets how much of an asset when a channel concludes.
//!
//! Regular channels carry an [Allocation]. Guarantor channels carry a
//! [Guarantee] that earmarks their funds for a joint channel instead of
//! paying out directly. The arithmetic here is pure; the objective runtime
//! persists whatever it accepts.

use crate::error::ProtocolError;
use crate::types::{Address, ChannelId, Destination, U256};
use serde::{Deserialize, Serialize};

/// A single payout entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationItem {
    pub destination: Destination,
    pub amount: U256,
}

/// Ordered payouts of one asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Asset holder address; one asset per outcome.
    pub asset: Address,
    pub items: Vec<AllocationItem>,
}

/// Funds earmarked in support of a joint channel, payable only towards the
/// listed destinations once the target concludes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Guarantee {
    pub asset: Address,
    pub target_channel: ChannelId,
    pub destinations: Vec<Destination>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Allocation(Allocation),
    Guarantee(Guarantee),
}

impl Outcome {
    pub fn simple(asset: Address, items: Vec<(Destination, U256)>) -> Self {
        Outcome::Allocation(Allocation {
            asset,
            items: items
                .into_iter()
                .map(|(destination, amount)| AllocationItem {
                    destination,
                    amount,
                })
                .collect(),
        })
    }

    pub fn as_allocation(&self) -> Option<&Allocation> {
        match self {
            Outcome::Allocation(a) => Some(a),
            Outcome::Guarantee(_) => None,
        }
    }

    pub fn as_guarantee(&self) -> Option<&Guarantee> {
        match self {
            Outcome::Guarantee(g) => Some(g),
            Outcome::Allocation(_) => None,
        }
    }

    /// Total amount promised by this outcome.
    pub fn total(&self) -> U256 {
        match self {
            Outcome::Allocation(a) => a.total(),
            // A guarantee promises nothing by itself; the guarantor's
            // holdings back the target channel instead.
            Outcome::Guarantee(_) => U256::zero(),
        }
    }
}

impl Allocation {
    pub fn total(&self) -> U256 {
        self.items
            .iter()
            .fold(U256::zero(), |acc, item| acc + item.amount)
    }

    pub fn amount_for(&self, destination: Destination) -> Option<U256> {
        self.items
            .iter()
            .find(|item| item.destination == destination)
            .map(|item| item.amount)
    }

    /// Fund `target` out of this (ledger) allocation: each of the target's
    /// allocation items is deducted from the matching destination here, and
    /// a single item paying the target channel the combined amount is
    /// appended.
    pub fn allocate_to_target(
        &self,
        target_items: &[AllocationItem],
        target: ChannelId,
    ) -> Result<Allocation, ProtocolError> {
        let insufficient = || ProtocolError::LedgerInsufficientFunds(target);
        let mut items = self.items.clone();
        let mut total = U256::zero();

        for wanted in target_items {
            let entry = items
                .iter_mut()
                .find(|item| item.destination == wanted.destination)
                .ok_or_else(insufficient)?;
            entry.amount = entry
                .amount
                .checked_sub(wanted.amount)
                .ok_or_else(insufficient)?;
            total = total + wanted.amount;
        }

        items.retain(|item| !item.amount.is_zero());
        items.push(AllocationItem {
            destination: target.into(),
            amount: total,
        });

        Ok(Allocation {
            asset: self.asset,
            items,
        })
    }

    /// Reverse of [Allocation::allocate_to_target]: remove the entry paying
    /// `target` and fold the concluded target's own payouts back in, merging
    /// with existing destinations.
    pub fn retrieve_from_target(
        &self,
        target_items: &[AllocationItem],
        target: ChannelId,
    ) -> Result<Allocation, ProtocolError> {
        let target_dest: Destination = target.into();
        let held = self
            .amount_for(target_dest)
            .ok_or(ProtocolError::LedgerInsufficientFunds(target))?;

        let returned: U256 = target_items
            .iter()
            .fold(U256::zero(), |acc, item| acc + item.amount);
        if returned != held {
            // The concluded channel's payouts must add up to exactly what
            // the ledger had earmarked for it.
            return Err(ProtocolError::LedgerInsufficientFunds(target));
        }

        let mut items: Vec<AllocationItem> = self
            .items
            .iter()
            .filter(|item| item.destination != target_dest)
            .cloned()
            .collect();

        for folded in target_items {
            match items
                .iter_mut()
                .find(|item| item.destination == folded.destination)
            {
                Some(entry) => entry.amount = entry.amount + folded.amount,
                None => items.push(*folded),
            }
        }

        Ok(Allocation {
            asset: self.asset,
            items,
        })
    }
}
