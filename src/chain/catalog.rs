//! Email-traffic chain catalogue
//!
//! Named chain categories with fixed VNF sequences. Inbound mail is
//! bidirectional (delivery receipts traverse the reverse path); outbound
//! and full inspection run one way.

use crate::chain::ChainRequest;
use crate::vnf::VnfType;
use serde::{Deserialize, Serialize};

/// Chain categories for email-security traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainCategory {
    /// Incoming mail: perimeter filter, spam classification, delivery
    InboundMail,
    /// Outgoing mail: encryption, content inspection, delivery
    OutboundMail,
    /// Full inspection of suspect traffic
    FullInspection,
}

impl ChainCategory {
    /// Every category.
    pub const ALL: [ChainCategory; 3] = [
        ChainCategory::InboundMail,
        ChainCategory::OutboundMail,
        ChainCategory::FullInspection,
    ];

    /// The VNF sequence traffic of this category traverses.
    pub fn sequence(&self) -> Vec<VnfType> {
        match self {
            ChainCategory::InboundMail => {
                vec![VnfType::Firewall, VnfType::SpamFilter, VnfType::Mail]
            }
            ChainCategory::OutboundMail => {
                vec![VnfType::Encryption, VnfType::ContentFilter, VnfType::Mail]
            }
            ChainCategory::FullInspection => vec![
                VnfType::Firewall,
                VnfType::Encryption,
                VnfType::SpamFilter,
                VnfType::ContentFilter,
                VnfType::Mail,
            ],
        }
    }

    /// Whether the category needs a complementary reverse chain.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, ChainCategory::InboundMail)
    }

    /// Build a request for this category at the given priority.
    pub fn request(&self, priority: u8) -> ChainRequest {
        let request = ChainRequest::new(self.sequence(), priority);
        if self.is_bidirectional() {
            request.bidirectional()
        } else {
            request
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_end_at_mail() {
        for category in ChainCategory::ALL {
            assert_eq!(category.sequence().last(), Some(&VnfType::Mail));
        }
    }

    #[test]
    fn inbound_is_bidirectional() {
        assert!(ChainCategory::InboundMail.request(5).bidirectional);
        assert!(!ChainCategory::OutboundMail.request(5).bidirectional);
    }
}
