use anyhow::{bail, Context, Result};
use hasp_emu::dispatcher::{self, Request, SystemClock};
use hasp_emu::loader::load_key_file;
use hasp_emu::token_state::TokenState;

/// Loads one token-definition file, prints its derived parameters, and
/// optionally replays a scripted command sequence against the dispatcher
/// in-process (no transport involved) — useful for debugging a key file
/// without standing up a listener.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("Usage: hasp_inspect KEY_FILE [--script SCRIPT_FILE]");
        return Ok(());
    }

    let key_file = &args[1];
    let key = load_key_file(key_file).with_context(|| format!("Cannot load key file: {key_file}"))?;

    println!("name:        {}", key.name);
    println!("created:     {}", key.created);
    println!("password:    0x{:08X}", key.password);
    println!("key_type:    0x{:02X}", key.key_type);
    println!("memory_type: 0x{:02X}", key.memory_type);
    println!("memory_size: {} bytes", key.memory_size());
    println!("sec_table:   {}", hex::encode(key.sec_table.0));
    println!("net_memory:  {}", hex::encode(key.net_memory));

    let mut script_file = None;
    let mut i = 2;
    while i < args.len() {
        if args[i] == "--script" && i + 1 < args.len() {
            script_file = Some(args[i + 1].clone());
            i += 1;
        }
        i += 1;
    }

    let Some(script_file) = script_file else {
        return Ok(());
    };

    let script = std::fs::read_to_string(&script_file)
        .with_context(|| format!("Cannot read script file: {script_file}"))?;

    let mut token = TokenState::new(key);
    let clock = SystemClock;

    for (line_no, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let request = parse_script_line(line)
            .with_context(|| format!("bad script line {}: {line}", line_no + 1))?;
        let response = dispatcher::dispatch(&mut token, request, &clock);
        println!("{line_no}: {line} -> {response:02X?}");
    }

    Ok(())
}

/// Parses one script line: five whitespace-separated fields, each either a
/// bare decimal number or a `0x`-prefixed hex number — `major_fn p1 p2 p3
/// out_cap`.
fn parse_script_line(line: &str) -> Result<Request> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        bail!("expected 5 fields (major_fn p1 p2 p3 out_cap), got {}", fields.len());
    }
    Ok(Request {
        major_fn: parse_number(fields[0])? as u8,
        p1: parse_number(fields[1])? as u16,
        p2: parse_number(fields[2])? as u16,
        p3: parse_number(fields[3])? as u16,
        out_cap: parse_number(fields[4])?,
    })
}

fn parse_number(s: &str) -> Result<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u32::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse()?)
    }
}
