use std::fmt;

use crate::tape::Tape;

/// Which tapes were recorded this session and which were never replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub new_tapes: Vec<String>,
    pub unused_tapes: Vec<String>,
}

impl Summary {
    pub fn from_tapes(tapes: &[Tape]) -> Self {
        let mut summary = Self::default();
        for tape in tapes {
            let name = tape.display_name().to_owned();
            if tape.is_new {
                summary.new_tapes.push(name);
            } else if !tape.used {
                summary.unused_tapes.push(name);
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.new_tapes.is_empty() && self.unused_tapes.is_empty()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== SUMMARY (talkback) =====")?;
        for (title, names) in [
            ("New tapes:", &self.new_tapes),
            ("Unused tapes:", &self.unused_tapes),
        ] {
            if names.is_empty() {
                continue;
            }
            writeln!(f, "{title}")?;
            for name in names {
                writeln!(f, "- {name}")?;
            }
        }
        Ok(())
    }
}
