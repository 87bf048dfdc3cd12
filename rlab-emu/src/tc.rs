//! Link quality classes and the `tc netem` commands that emulate them.
//!
//! A link is best-effort unless it carries emulated impairments. Impairments are installed as a
//! single `netem` root qdisc on each end of the virtual pair, so both directions see the same
//! conditions:
//!
//! ```text
//! tc qdisc replace dev <if> root netem [limit N] [delay Dus [Jus]] [loss P%] [duplicate P%]
//!     [rate Rmbit]
//! ```

use serde::{Deserialize, Serialize};

/// Emulated impairments for a link. The default value is the best-effort class.
///
/// ```
/// use rlab_emu::tc::LinkQuality;
///
/// let satellite = LinkQuality {
///     delay_us: 300_000,            // 300ms one-way delay
///     jitter_us: 50_000,            // ±50ms variation
///     loss_percent: 1.0,            // 1% packet loss
///     bandwidth_mbit_s: Some(10.0), // 10 Mbit/s cap
///     ..Default::default()
/// };
/// assert!(!satellite.is_best_effort());
/// assert!(LinkQuality::default().is_best_effort());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkQuality {
    /// Base one-way delay, in microseconds.
    pub delay_us: u32,
    /// Random variation added to the delay, in microseconds. Ignored without a delay.
    pub jitter_us: u32,
    /// Packet loss percentage (0.0 to 100.0).
    pub loss_percent: f64,
    /// Packet duplication percentage (0.0 to 100.0).
    pub duplicate_percent: f64,
    /// Rate limit in Mbit/s, unlimited when `None`.
    pub bandwidth_mbit_s: Option<f64>,
    /// Maximum packets queued by netem, netem's default (1000) when `None`.
    pub queue_limit: Option<u32>,
}

impl LinkQuality {
    /// Whether this is the plain best-effort class, needing no qdisc at all.
    pub fn is_best_effort(&self) -> bool {
        *self == Self::default()
    }

    /// The netem parameters following `netem` on the command line.
    pub fn netem_params(&self) -> Vec<String> {
        let mut params = Vec::new();

        if let Some(limit) = self.queue_limit {
            params.extend(["limit".to_string(), limit.to_string()]);
        }

        if self.delay_us > 0 {
            params.extend(["delay".to_string(), format!("{}us", self.delay_us)]);
            if self.jitter_us > 0 {
                params.push(format!("{}us", self.jitter_us));
            }
        }

        if self.loss_percent > 0.0 {
            params.extend(["loss".to_string(), format!("{}%", self.loss_percent)]);
        }

        if self.duplicate_percent > 0.0 {
            params.extend(["duplicate".to_string(), format!("{}%", self.duplicate_percent)]);
        }

        if let Some(rate) = self.bandwidth_mbit_s {
            params.extend(["rate".to_string(), format!("{rate}mbit")]);
        }

        params
    }
}

/// The argv installing (or replacing) the netem root qdisc for `quality` on `dev`.
pub fn netem_argv(dev: &str, quality: &LinkQuality) -> Vec<String> {
    let mut argv: Vec<String> = ["tc", "qdisc", "replace", "dev", dev, "root", "netem"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    argv.extend(quality.netem_params());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_effort_has_no_params() {
        assert!(LinkQuality::default().netem_params().is_empty());
    }

    #[test]
    fn netem_argv_renders_every_impairment() {
        let quality = LinkQuality {
            delay_us: 10_000,
            jitter_us: 1_000,
            loss_percent: 2.5,
            duplicate_percent: 0.1,
            bandwidth_mbit_s: Some(100.0),
            queue_limit: Some(5000),
        };

        assert_eq!(
            netem_argv("h1-eth0", &quality).join(" "),
            concat!(
                "tc qdisc replace dev h1-eth0 root netem limit 5000 ",
                "delay 10000us 1000us loss 2.5% duplicate 0.1% rate 100mbit"
            )
        );
    }

    #[test]
    fn jitter_without_delay_is_dropped() {
        let quality = LinkQuality { jitter_us: 1_000, loss_percent: 1.0, ..Default::default() };
        assert_eq!(quality.netem_params(), ["loss", "1%"]);
    }
}
