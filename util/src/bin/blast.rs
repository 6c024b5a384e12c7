use byteorder::{LittleEndian, WriteBytesExt};
use clap::{App, Arg};
use keel::logging;
use squall::{
    Client, ClientHandler, ClientParams, ConnId, ConnState, Connection, Error, PayloadRef,
    RawAddr, Reason, TextAddr,
};
use std::thread;
use std::time::Duration;

struct Pong;

impl ClientHandler for Pong {
    fn on_error(&mut self, code: Error, text: &str) {
        eprintln!("client error {}: {}", code.code(), text);
    }

    fn on_payload(&mut self, _client: &mut Client, conn: ConnId, payload: &PayloadRef) {
        println!("{}: {} byte reply", conn, payload.len());
    }

    fn on_disconnect(&mut self, conn: &Connection, reason: Reason) {
        println!("{}: disconnected ({:?})", conn.id(), reason);
    }
}

pub fn main() {
    let matches = App::new("blast")
        .about("Connects to an echo server and fires numbered payloads at it.")
        .arg(Arg::with_name("HOST").help("Server host").required(true))
        .arg(Arg::with_name("PORT").help("Server port").required(true))
        .arg(
            Arg::with_name("COUNT")
                .help("Number of payloads to send")
                .required(true),
        )
        .arg(
            Arg::with_name("APP_ID")
                .help("Application id the server expects")
                .required(true),
        )
        .get_matches();

    let host = matches.value_of("HOST").unwrap();
    let port = matches.value_of("PORT").unwrap();
    let count: u64 = matches
        .value_of("COUNT")
        .unwrap()
        .parse()
        .expect("COUNT must be a number");
    let app_id: u16 = matches
        .value_of("APP_ID")
        .unwrap()
        .parse()
        .expect("APP_ID must be a number");

    let log = logging::init();

    let addr = RawAddr::resolve(&TextAddr::new(host, port)).expect("Address did not resolve");

    let params = ClientParams {
        app_id,
        app_version: 1,
        ..ClientParams::default()
    };
    let mut client = Client::new(params, Box::new(Pong), &log).expect("Client failed to start");

    let conn = client.connect(addr, None).expect("Connect failed");

    let mut sent = 0u64;
    for _ in 0..5000 {
        client.poll();

        let ready = match client.connection(conn).map(|state| state.state()) {
            Some(ConnState::Initial) | Some(ConnState::Connected) => true,
            Some(_) => false,
            None => break,
        };

        if ready && sent < count {
            let mut payload = client.payload();
            payload
                .data_mut()
                .write_u64::<LittleEndian>(sent)
                .expect("Error writing sequence number");
            if client.send(conn, payload.into()).is_ok() {
                sent += 1;
            }
        }

        thread::sleep(Duration::from_millis(1));
    }

    logging::info!(log, "done"; "sent" => sent);

    if client.connection(conn).is_some() {
        let _ = client.disconnect(conn);
    }
    client.terminate();
}
