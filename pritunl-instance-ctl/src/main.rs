use std::process;

use pritunl_instance_lib::command::{Command, InstanceStatus, Response};
use pritunl_instance_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();

    let cmd: Command = args.command.into();
    let resp = match socket::send_command(&args.socket_path, &cmd) {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error processing {cmd}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&resp)
    } else {
        pretty_print(&resp)
    };

    process::exit(determine_exitcode(&resp));
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Status(instances) if instances.is_empty() => {
            println!("No instances running");
        }
        Response::Status(instances) => {
            for InstanceStatus { server_id, instance_id, state, interface } in instances {
                let interface = interface.as_deref().unwrap_or("-");
                println!("{server_id} {instance_id} {state} {interface}");
            }
        }
        Response::Ok => println!("ok"),
        Response::Error(message) => eprintln!("Error: {message}"),
    }
}

fn determine_exitcode(resp: &Response) -> exitcode::ExitCode {
    match resp {
        Response::Status(_) => exitcode::OK,
        Response::Ok => exitcode::OK,
        Response::Error(_) => exitcode::SOFTWARE,
    }
}
