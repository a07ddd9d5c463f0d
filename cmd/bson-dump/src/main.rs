//! BSON stream dumper
//!
//! Reads concatenated documents from a file (or stdin when the path is
//! `-` or missing) and prints each one as an indented tree.
//!
//! Usage:
//!     bson-dump [file] [path]
//!
//! With `path`, only the subtree at that path is printed, and documents
//! without it are skipped.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};

use efc::bson::{BsonDocument, BsonParser};
use efc::Result;

fn open(arg: Option<&str>) -> Result<Box<dyn Read>> {
    Ok(match arg {
        None | Some("-") => Box::new(io::stdin().lock()),
        Some(p) => Box::new(BufReader::new(File::open(p)?)),
    })
}

fn dump(input: Box<dyn Read>, path: Option<&str>) -> Result<u64> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut parser = BsonParser::new(input);
    let mut doc = BsonDocument::new();
    let mut shown = 0;
    while parser.next_bson(&mut doc)? {
        let n = parser.documents();
        match path {
            None => {
                writeln!(out, "# document {} ({} nodes)", n, doc.len())?;
                write!(out, "{}", doc)?;
            }
            Some(p) => {
                let Some(id) = doc.find(p) else {
                    log::debug!("document {} has no {}", n, p);
                    continue;
                };
                let sub = BsonDocument::import(&doc.to_bytes(p, false)?)?;
                writeln!(out, "# document {} at {}", n, doc.path_of(id).unwrap_or_default())?;
                write!(out, "{}", sub)?;
            }
        }
        shown += 1;
    }
    out.flush()?;
    Ok(shown)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();
    let file = args.get(1).map(String::as_str);
    let path = args.get(2).map(String::as_str);

    let result = open(file).and_then(|input| dump(input, path));
    match result {
        Ok(n) => log::info!("{} document(s)", n),
        Err(e) => {
            eprintln!("bson-dump: {}", e);
            std::process::exit(1);
        }
    }
}
