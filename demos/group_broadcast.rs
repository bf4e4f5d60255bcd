//! Accepts any number of connections, adds each to a `ConnectionGroup`, and
//! every 2 seconds broadcasts one message to the whole group — grounded on
//! the broadcast-enqueue behavior of spec.md §4.7.

use std::sync::Arc;

use structopt::StructOpt;

use rpma::config::{Config, Flags};
use rpma::dispatcher::Dispatcher;
use rpma::zone::{TimeoutAction, Zone, ZoneEvent};
use rpma::{Connection, ConnectionGroup};

#[derive(StructOpt)]
struct Opt {
    #[structopt(long, default_value = "0.0.0.0")]
    addr: String,

    #[structopt(long, default_value = "7206")]
    service: String,

    #[structopt(long, default_value = "2")]
    workers: usize,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let cfg = Config::new()
        .set_addr(opt.addr)
        .unwrap()
        .set_service(opt.service)
        .unwrap()
        .set_flags(Flags::IS_SERVER);

    let zone = Zone::new(&cfg).expect("zone setup failed");
    let group = Arc::new(ConnectionGroup::new());
    let dispatchers: Vec<Dispatcher> = (0..opt.workers).map(|_| Dispatcher::new()).collect();
    let worker_threads: Vec<_> = dispatchers
        .iter()
        .cloned()
        .map(|disp| std::thread::spawn(move || disp.dispatch_loop()))
        .collect();

    let mut next_worker = 0usize;
    zone.register_on_connection_event({
        let group = group.clone();
        let dispatchers = dispatchers.clone();
        move |zone, event| match event {
            ZoneEvent::Incoming => {
                let conn = Connection::new(zone)?;
                conn.register_on_recv(|_conn, buf| {
                    log::info!("member said: {} bytes", buf.len());
                    Ok(())
                });
                conn.accept()?;
                group.add(conn.clone());
                let disp = &dispatchers[next_worker % dispatchers.len()];
                next_worker = next_worker.wrapping_add(1);
                conn.attach(disp)
            }
            ZoneEvent::Disconnect(conn) => {
                group.remove(&conn);
                Ok(())
            }
            ZoneEvent::Outgoing => unreachable!("server never fires Outgoing"),
        }
    });

    zone.register_on_timeout(2000, {
        let group = group.clone();
        let broadcast_disp = dispatchers[0].clone();
        move |_zone| {
            if !group.is_empty() {
                group.group_enqueue(&broadcast_disp, |conn| {
                    let ptr = conn.msg_get_ptr();
                    conn.send(ptr)
                });
            }
            TimeoutAction::Continue
        }
    })
    .unwrap();

    log::info!("listening, broadcasting to {} dispatcher workers", opt.workers);
    zone.wait_connections().expect("event loop failed");

    for disp in &dispatchers {
        disp.dispatch_break();
    }
    for handle in worker_threads {
        let _ = handle.join();
    }
}
