use std::env;
use std::fs;
use std::process::ExitCode;

use script_bridge::{MethodSuite, VM};

/// Methods available to the script through its `api` argument.
fn host_suite() -> MethodSuite {
    MethodSuite::new()
        .with("print", |vm: &mut VM| {
            let parts: Vec<String> = (0..vm.get_top()).map(|i| vm.safe_to_string(i)).collect();
            println!("{}", parts.join(" "));
            0
        })
        .with("env", |vm: &mut VM| {
            let name = vm.safe_to_string(0);
            match env::var(&name) {
                Ok(value) => vm.push_string(&value),
                Err(_) => vm.push_undefined(),
            }
            1
        })
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <filename>", args[0]);
        return ExitCode::FAILURE;
    }
    let filename = &args[1];

    let source = match fs::read_to_string(filename) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Failed to read {}: {}", filename, err);
            return ExitCode::FAILURE;
        }
    };

    let mut vm = VM::new();
    match vm.eval_with_suite(&source, &host_suite()) {
        Ok(()) => {
            if !vm.get_type(-1).is_undefined() {
                println!("{}", vm.safe_to_string(-1));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
