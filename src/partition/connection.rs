//! Connection states between partitions.

use crate::error::{Error, Result};
use crate::ids::PartitionId;
use serde::{Deserialize, Serialize};

/// Packet delay applied to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum DelayDistribution {
    /// Constant delay.
    Uniform {
        /// Delay in milliseconds.
        delay_ms: u32,
    },
    /// Normally distributed delay.
    Normal {
        /// Mean delay in milliseconds.
        mean_ms: u32,
        /// Standard deviation in milliseconds.
        std_dev_ms: u32,
        /// Correlation with the previous packet's delay, in percent.
        correlation: f32,
    },
}

impl DelayDistribution {
    fn validate(&self) -> Result<()> {
        if let Self::Normal { correlation, .. } = self
            && !(correlation.is_finite() && (0.0..=100.0).contains(correlation))
        {
            return Err(Error::InvalidTopology(format!(
                "delay correlation must be within 0..=100, got {correlation}"
            )));
        }
        Ok(())
    }
}

/// Connectivity from one partition to another.
///
/// `Blocked` supersedes any loss or delay; a shaped state with zero loss and
/// no delay is fully open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No traffic passes.
    Blocked,
    /// Traffic passes, possibly degraded.
    Shaped {
        /// Percentage of packets dropped, `0.0..=100.0`.
        #[serde(default)]
        packet_loss_percentage: f32,
        /// Optional delay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packet_delay: Option<DelayDistribution>,
    },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::allowed()
    }
}

impl ConnectionState {
    /// Fully open connection.
    #[must_use]
    pub fn allowed() -> Self {
        Self::Shaped {
            packet_loss_percentage: 0.0,
            packet_delay: None,
        }
    }

    /// Fully blocked connection.
    #[must_use]
    pub fn blocked() -> Self {
        Self::Blocked
    }

    /// Open connection dropping `percentage` of packets.
    #[must_use]
    pub fn lossy(percentage: f32) -> Self {
        Self::Shaped {
            packet_loss_percentage: percentage,
            packet_delay: None,
        }
    }

    /// Whether no traffic passes.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }

    /// Whether traffic passes without any loss or delay.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(
            self,
            Self::Shaped { packet_loss_percentage, packet_delay: None } if *packet_loss_percentage == 0.0
        )
    }

    /// Effective packet loss; blocked counts as 100%.
    #[must_use]
    pub fn packet_loss_percentage(&self) -> f32 {
        match self {
            Self::Blocked => 100.0,
            Self::Shaped {
                packet_loss_percentage,
                ..
            } => *packet_loss_percentage,
        }
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] for a loss outside `0..=100` or a
    /// malformed delay.
    pub fn validate(&self) -> Result<()> {
        if let Self::Shaped {
            packet_loss_percentage,
            packet_delay,
        } = self
        {
            if !(packet_loss_percentage.is_finite()
                && (0.0..=100.0).contains(packet_loss_percentage))
            {
                return Err(Error::InvalidTopology(format!(
                    "packet loss must be within 0..=100, got {packet_loss_percentage}"
                )));
            }
            if let Some(delay) = packet_delay {
                delay.validate()?;
            }
        }
        Ok(())
    }
}

/// Unordered pair of distinct partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    lower: PartitionId,
    upper: PartitionId,
}

impl PartitionConnectionId {
    /// Normalizes `(a, b)` so that `(a, b)` and `(b, a)` are equal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if `a == b`; a partition is always
    /// connected to itself.
    pub fn new(a: PartitionId, b: PartitionId) -> Result<Self> {
        if a == b {
            return Err(Error::InvalidTopology(format!(
                "connection endpoints must differ, got '{a}' twice"
            )));
        }
        let (lower, upper) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { lower, upper })
    }

    /// Lexically smaller endpoint.
    #[must_use]
    pub fn lower(&self) -> &PartitionId {
        &self.lower
    }

    /// Lexically larger endpoint.
    #[must_use]
    pub fn upper(&self) -> &PartitionId {
        &self.upper
    }

    /// Whether `partition` is one of the endpoints.
    #[must_use]
    pub fn involves(&self, partition: &PartitionId) -> bool {
        self.lower == *partition || self.upper == *partition
    }
}

impl std::fmt::Display for PartitionConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.lower, self.upper)
    }
}
