//! A loopback handshake example
//!
//! Starts one stack, listens on a port with one block and connects to it from another over the
//! loopback address. Both sides print their sequence variables, then the client closes its side
//! and the server reports the half-closed connection.
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

use ngstack::{Config, Stack};
use ngstack::layer::tcp::{self, Connection, OpenFlags, Tcb};
use ngstack::netreg::NetType;
use ngstack::wire::Ipv6Address;

fn main() {
    let Options {
        port,
        timeout,
    } = Options::from_args();

    let mut config = Config::default();
    config.tcp.syn_sent_timeout = Duration::from_millis(timeout);
    config.tcp.syn_rcvd_timeout = Duration::from_millis(timeout);
    let stack = Stack::new(config);
    tcp::init(&stack).expect("Couldn't start the tcp thread");

    let server = Tcb::new(&stack);
    let server = thread::spawn(move || {
        let result = server.open(port, &[], 0, OpenFlags::PASSIVE);
        (server, result)
    });

    let listening = Instant::now() + Duration::from_millis(timeout);
    while stack.netreg().read().count(NetType::Tcp, tcp::context(port, 0)) == 0 {
        assert!(Instant::now() < listening, "Server did not start listening");
        thread::sleep(Duration::from_millis(1));
    }

    let client = Tcb::new(&stack);
    client.open(0, Ipv6Address::LOOPBACK.as_bytes(), port, OpenFlags::ACTIVE)
        .expect("Couldn't connect to the server");
    let (server, result) = server.join().unwrap();
    result.expect("Server didn't accept the connection");

    print_connection("client", &client.connection());
    print_connection("server", &server.connection());

    client.close().expect("Couldn't close the connection");
    server.poll(Some(Duration::from_millis(timeout)));
    println!("client {:?}, server {:?}", client.state(), server.state());
}

fn print_connection(name: &str, connection: &Connection) {
    println!("{}: [{}]:{} -> [{}]:{} {:?}",
        name,
        connection.local_addr, connection.local_port,
        connection.remote_addr, connection.remote_port,
        connection.current);
    println!("{}: iss={} snd.nxt={} irs={} rcv.nxt={}",
        name,
        connection.send.initial_seq, connection.send.next,
        connection.recv.initial_seq, connection.recv.next);
}

#[derive(StructOpt)]
struct Options {
    /// The port the server listens on.
    #[structopt(short = "p", long = "port", default_value = "2000")]
    port: u16,
    /// Milliseconds to wait for each step of the handshake.
    #[structopt(short = "t", long = "timeout", default_value = "1000")]
    timeout: u64,
}
