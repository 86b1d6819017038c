// SPDX-License-Identifier: Apache-2.0

use std::fmt::{self, Formatter};

use clap::Args;
use serde::Serialize;
use sgx_step::probe::{self, Datum};

/// Show whether this system can single-step enclaves
#[derive(Args, Debug)]
pub struct Options {
    #[clap(short, long)]
    /// Emit JSON rather than human-readable output
    json: bool,
}

#[derive(Serialize)]
struct Info {
    version: &'static str,
    platform: Vec<Datum>,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use colorful::*;

        fn get_icon(is_atty: bool, pass: bool) -> String {
            match is_atty {
                true => match pass {
                    true => "✔".green().to_string(),
                    false => "✗".red().to_string(),
                },
                false => match pass {
                    true => "✔".into(),
                    false => "✗".into(),
                },
            }
        }

        let is_atty = atty::is(atty::Stream::Stdout);
        let pass = self.platform.iter().all(|x| x.pass);

        writeln!(f, "sgx-step version {}", self.version)?;
        writeln!(f, "{} Single-stepping", get_icon(is_atty, pass))?;

        for datum in &self.platform {
            let icon = get_icon(is_atty, datum.pass);
            write!(f, "  {} {}", icon, datum.name)?;

            if let Some(ref info) = datum.info {
                write!(f, ": {}", info)?;
            }
            writeln!(f)?;
        }

        for datum in &self.platform {
            if let Some(mesg) = datum.mesg.as_ref() {
                writeln!(f, "\n  {}\n", mesg)?;
            }
        }

        Ok(())
    }
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let info = Info {
            version: env!("CARGO_PKG_VERSION"),
            platform: probe::data(),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            println!("{}", info);
        }

        Ok(())
    }
}

#[test]
fn test_info() {
    Options { json: true }.execute().unwrap();
    Options { json: false }.execute().unwrap();
}
