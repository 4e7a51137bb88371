mod session;

use std::env;
use std::io;
use std::process;

use session::{Scenario, Session};

fn main() -> io::Result<()> {
    let scenarios = parse_scenarios().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: ecu-emulator [--scenario <a|b|c|all>] | ecu-emulator <a|b|c|all>");
        process::exit(2);
    });

    for scenario in scenarios {
        let mut session = Session::for_scenario(scenario)?;
        session.run(scenario)?;
        let summary = session.summary();
        println!("{} -> {}", scenario.header(), scenario.log_path());
        println!(
            "  cycles={} sequential={} semi_sequential={} stale={} limp_entered={} limp_exited={}",
            summary.cycles,
            summary.sequential,
            summary.semi_sequential,
            summary.stale,
            summary.limp_entered,
            summary.limp_exited,
        );
    }
    Ok(())
}

fn parse_scenarios() -> Result<Vec<Scenario>, String> {
    let mut args = env::args().skip(1);
    let tag = match args.next() {
        Some(arg) => {
            if let Some(value) = arg.strip_prefix("--scenario=") {
                value.to_string()
            } else if arg == "--scenario" {
                args.next().ok_or_else(|| "Expected value after --scenario".to_string())?
            } else {
                arg
            }
        }
        None => return Ok(Scenario::ALL.to_vec()),
    };
    if tag.eq_ignore_ascii_case("all") {
        Ok(Scenario::ALL.to_vec())
    } else {
        Scenario::from_tag(&tag).map(|scenario| vec![scenario])
    }
}
