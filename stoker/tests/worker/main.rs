//! Child-side relay client driven by the integration tests.
//!
//! Dials back to the address in `STOKER_RELAY`, performs the pid
//! handshake and then serves requests according to the mode given on the
//! command line:
//!
//!   echo            reply with the request body
//!   error           reply with a job error carrying the request body
//!   broken          crash with an uncaught error on the first request
//!   failboot        exit immediately without connecting
//!   slow <ms>       sleep before dialing back, then echo
//!   delay <ms>      sleep before every reply, then echo
//!   stop <n>        echo, but answer the n-th request with a stop request
//!   invalid         answer the handshake with garbage
//!   wrong-pid       answer the handshake with somebody else's pid

use std::time::Duration;
use stoker::payload::Payload;
use stoker::relay::{parse_pid_frame, pid_frame, Frame, Relay};
use stoker::{RELAY_ADDRESS_ENV, STOP_REQUEST};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(String::as_str).unwrap_or("echo");

    if mode == "failboot" {
        eprintln!("failboot");
        std::process::exit(1);
    }

    if mode == "slow" {
        let millis: u64 = args.get(1).map(|arg| arg.parse()).transpose()?.unwrap_or(500);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    let address = std::env::var(RELAY_ADDRESS_ENV)?;
    let mut relay = Relay::connect(&address).await?;

    // handshake: the parent announces itself first, then expects our pid
    let greeting = relay.receive().await?;
    parse_pid_frame(&greeting)?;
    match mode {
        "invalid" => {
            relay.send(Frame::control("not a pid")).await?;
            // linger; the parent decides what happens to us
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }
        "wrong-pid" => {
            relay.send(pid_frame(std::process::id().wrapping_add(1))).await?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }
        _ => relay.send(pid_frame(std::process::id())).await?,
    }

    let stop_at: u64 = match mode {
        "stop" => args.get(1).map(|arg| arg.parse()).transpose()?.unwrap_or(1),
        _ => 0,
    };
    let delay: u64 = match mode {
        "delay" => args.get(1).map(|arg| arg.parse()).transpose()?.unwrap_or(0),
        _ => 0,
    };

    let mut served: u64 = 0;
    loop {
        let frame = relay.receive().await?;
        if frame.is_control() {
            if frame.body.as_ref() == STOP_REQUEST.as_bytes() {
                return Ok(());
            }
            continue;
        }

        served += 1;
        let request = frame.into_payload();

        match mode {
            "broken" => {
                eprintln!("undefined_function()");
                std::process::exit(1);
            }
            "error" => {
                relay.send(Frame::job_error(request.body.clone())).await?;
            }
            _ if stop_at != 0 && served == stop_at => {
                relay
                    .send(Frame::from_payload(&Payload::new("", STOP_REQUEST)))
                    .await?;
            }
            _ => {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                relay
                    .send(Frame::from_payload(&Payload::from_body(request.body)))
                    .await?;
            }
        }
    }
}
