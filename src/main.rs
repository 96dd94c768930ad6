#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;

mod compiler;
mod debug;
mod memory;
mod table;
mod vm;

use memory::GC;
use vm::VM;

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = match args.len() {
        1 => repl(),
        2 => run_file(Path::new(&args[1])),
        _ => {
            eprintln!("Usage: loxide [path]");
            EXIT_USAGE
        }
    };
    process::exit(code);
}

/// Line-at-a-time REPL. The VM is shared across lines, so globals,
/// functions and classes persist; errors are reported and the loop
/// continues.
fn repl() -> i32 {
    let mut gc = GC::new();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut vm = VM::new(&mut gc, &mut out);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("Could not read input: {}", err);
                return EXIT_IO_ERROR;
            }
        };
        // Diagnostics are already on stderr; keep reading.
        let _ = vm.interpret(&line);
    }
    0
}

fn run_file(path: &Path) -> i32 {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("Could not read {}: {}", path.display(), err);
            return EXIT_IO_ERROR;
        }
    };

    let mut gc = GC::new();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut vm = VM::new(&mut gc, &mut out);

    match vm.interpret(&contents) {
        Ok(()) => 0,
        Err(err) if err.is_compile_error() => EXIT_COMPILE_ERROR,
        Err(_) => EXIT_RUNTIME_ERROR,
    }
}
