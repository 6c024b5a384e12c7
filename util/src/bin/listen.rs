use clap::{App, Arg};
use keel::logging;
use squall::{
    Error, GroupHandler, GroupId, PayloadRef, PeerId, Server, ServerHandler, ServerParams,
};
use std::thread;
use std::time::Duration;

// One room for everybody; every payload goes straight back to its sender.
struct Room;

impl GroupHandler for Room {
    fn on_peer_message(&mut self, server: &mut Server, peer: PeerId, payload: &PayloadRef) {
        let mut echo = server.payload();
        if echo.write(payload.data()).is_ok() {
            let _ = server.peer_enqueue(peer, echo.into());
        }
    }
}

struct Echo {
    room: Option<GroupId>,
}

impl ServerHandler for Echo {
    fn on_error(&mut self, code: Error, text: &str) {
        eprintln!("server error {}: {}", code.code(), text);
    }

    fn on_peer_new(&mut self, server: &mut Server, peer: PeerId, _payload: &PayloadRef) {
        let room = match self.room {
            Some(room) => room,
            None => {
                let room = server.group_create(Box::new(Room));
                self.room = Some(room);
                room
            }
        };
        let _ = server.group_peer_add(peer, room);

        if let Some(addr) = server.peer_addr_format(peer) {
            println!("peer {} joined from {}", peer, addr);
        }
    }
}

pub fn main() {
    let matches = App::new("listen")
        .about("Runs an echo server that bounces every payload back to its sender.")
        .arg(
            Arg::with_name("PORT")
                .help("UDP port to listen on (0 for the default)")
                .required(true),
        )
        .arg(
            Arg::with_name("APP_ID")
                .help("Application id clients must present")
                .required(true),
        )
        .get_matches();

    let port: u16 = matches
        .value_of("PORT")
        .unwrap()
        .parse()
        .expect("PORT must be a number");
    let app_id: u16 = matches
        .value_of("APP_ID")
        .unwrap()
        .parse()
        .expect("APP_ID must be a number");

    let log = logging::init();

    let params = ServerParams {
        port,
        app_id,
        app_version: 1,
        ..ServerParams::default()
    };

    let server = Server::new(params, Box::new(Echo { room: None }), &log)
        .expect("Server failed to start");

    logging::info!(log, "listening"; "port" => port, "app_id" => app_id);

    let _worker = server.run().expect("Worker failed to start");

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
