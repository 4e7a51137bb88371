use std::io;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Scenario, Session};

/// Regenerates every file under `evidence/` and fails when a scenario does
/// not show the behaviour it exists to document.
fn main() -> io::Result<()> {
    for scenario in Scenario::ALL {
        let mut session = Session::for_scenario(scenario)?;
        session.run(scenario)?;
        check(scenario, &session)?;
        println!("wrote {}", scenario.log_path());
    }
    Ok(())
}

fn check<W: io::Write>(scenario: Scenario, session: &Session<W>) -> io::Result<()> {
    let summary = session.summary();
    let ok = match scenario {
        Scenario::FullSync => summary.sync_acquired && summary.sequential > 0 && summary.semi_sequential == 0,
        Scenario::CamLost => !summary.sync_acquired && summary.semi_sequential > 0 && summary.sequential == 0,
        Scenario::Overheat => summary.limp_entered && summary.limp_exited,
    };
    if ok {
        Ok(())
    } else {
        Err(io::Error::other(format!("{}: unexpected outcome {summary:?}", scenario.header())))
    }
}
