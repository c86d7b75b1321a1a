use remodb::backup::archive::{decode_archive, inspect_archive, verify_archive};
use std::fs;
use std::path::PathBuf;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "backup" => match args.get(2).map(String::as_str) {
            Some("inspect") => cmd_backup_inspect(&args[3..]),
            Some("verify") => cmd_backup_verify(&args[3..]),
            Some(other) => Err(format!("unknown backup command: {other}")),
            None => Err("missing backup subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn read_archive(args: &[String]) -> Result<(PathBuf, Vec<u8>), String> {
    let mut path = None;
    let mut idx = 0;
    while idx < args.len() {
        if args[idx] == "--hmac-key-hex" {
            idx += 2;
            continue;
        }
        if !args[idx].starts_with("--") {
            path = Some(PathBuf::from(&args[idx]));
            break;
        }
        idx += 1;
    }
    let path = path.ok_or("archive file is required")?;
    let bytes = fs::read(&path).map_err(|e| format!("read {}: {e}", path.display()))?;
    Ok((path, bytes))
}

fn cmd_backup_inspect(args: &[String]) -> Result<(), String> {
    let (path, bytes) = read_archive(args)?;
    let summary = inspect_archive(&bytes).map_err(|e| e.to_string())?;
    if args.iter().any(|a| a == "--json") {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(());
    }
    println!("file\t{}", path.display());
    println!("catalog\t{}", summary.catalog);
    println!("catalog_version\t{}", summary.catalog_version);
    println!("created_at_micros\t{}", summary.created_at_micros);
    println!("entities\t{}", summary.entity_count);
    println!("entity_types\t{}", summary.entity_types.join(","));
    println!("signed\t{}", summary.signed);
    println!("compressed_bytes\t{}", summary.compressed_bytes);
    println!("sha256\t{}", summary.sha256);
    Ok(())
}

fn cmd_backup_verify(args: &[String]) -> Result<(), String> {
    let (path, bytes) = read_archive(args)?;
    let key = parse_hmac_key_hex(args)?;
    verify_archive(&bytes, key.as_deref()).map_err(|e| e.to_string())?;
    if args.iter().any(|a| a == "--deep") {
        let payload = decode_archive(&bytes, key.as_deref()).map_err(|e| e.to_string())?;
        println!(
            "decoded\t{}\t{} entities",
            payload.catalog,
            payload.entities.len()
        );
    }
    println!(
        "ok\t{}\t{}",
        path.display(),
        if key.is_some() { "signature verified" } else { "checksum verified" }
    );
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_hmac_key_hex(args: &[String]) -> Result<Option<Vec<u8>>, String> {
    let Some(hex_key) = parse_flag_value(args, "--hmac-key-hex") else {
        return Ok(None);
    };
    hex::decode(hex_key)
        .map(Some)
        .map_err(|e| format!("invalid --hmac-key-hex: {e}"))
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  remodb backup inspect <archive> [--json]");
    eprintln!("  remodb backup verify <archive> [--hmac-key-hex <hex>] [--deep]");
}
