//! Support for the PVGPU_DEBUG environment variable.

use bitflags::bitflags;

/// Environment variable read once when a screen is created.
pub const DEBUG_ENV_VAR: &str = "PVGPU_DEBUG";

bitflags! {
    /// Diagnostic switches. None of them change what reaches the device
    /// except for extra annotation commands.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u64 {
        /// Emit annotation commands into the stream.
        const ANNOTATE = 1 << 0;
        /// Log every relocation as it is recorded and patched.
        const RELOC = 1 << 1;
        /// Log flushes, including implicit ones.
        const FLUSH = 1 << 2;
        /// Log fence creation and completion.
        const FENCE = 1 << 3;
        /// Wait for every fence right after submission.
        const SYNC = 1 << 4;
        /// Log map and unmap.
        const MAP = 1 << 5;
        /// Dump resolved command buffers at trace level.
        const HEX = 1 << 6;
        /// Log rebind prologues.
        const REBIND = 1 << 7;
    }
}

const DEBUG_CONTROL: &[(&str, DebugFlags)] = &[
    ("ann", DebugFlags::ANNOTATE),
    ("annotate", DebugFlags::ANNOTATE),
    ("reloc", DebugFlags::RELOC),
    ("flush", DebugFlags::FLUSH),
    ("fence", DebugFlags::FENCE),
    ("sync", DebugFlags::SYNC),
    ("map", DebugFlags::MAP),
    ("hex", DebugFlags::HEX),
    ("rebind", DebugFlags::REBIND),
];

impl DebugFlags {
    /// Parse a comma or space separated list of flag names. The whole
    /// string `all` enables every flag; unknown names are ignored.
    pub fn parse(debug: &str) -> Self {
        let debug = debug.trim();
        if debug == "all" {
            return DEBUG_CONTROL
                .iter()
                .fold(DebugFlags::empty(), |acc, (_, flag)| acc | *flag);
        }

        debug
            .split([',', ' '])
            .filter(|name| !name.is_empty())
            .flat_map(|name| {
                DEBUG_CONTROL
                    .iter()
                    .filter(move |(control, _)| *control == name)
                    .map(|(_, flag)| *flag)
            })
            .fold(DebugFlags::empty(), |acc, flag| acc | flag)
    }

    /// Read [`DEBUG_ENV_VAR`].
    pub fn from_env() -> Self {
        std::env::var(DEBUG_ENV_VAR)
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            DebugFlags::parse("reloc,fence"),
            DebugFlags::RELOC | DebugFlags::FENCE
        );
        assert_eq!(
            DebugFlags::parse("ann sync"),
            DebugFlags::ANNOTATE | DebugFlags::SYNC
        );
        assert_eq!(DebugFlags::parse(", ,map,,"), DebugFlags::MAP);
    }

    #[test]
    fn test_parse_all_and_unknown() {
        assert_eq!(DebugFlags::parse("all"), DebugFlags::all());
        assert_eq!(DebugFlags::parse("bogus"), DebugFlags::empty());
        assert_eq!(DebugFlags::parse(""), DebugFlags::empty());
        // "all" only counts as the whole string
        assert_eq!(DebugFlags::parse("all,reloc"), DebugFlags::RELOC);
    }
}
