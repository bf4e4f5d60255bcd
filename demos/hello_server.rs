//! Accepts connections and echoes every message, grounded on
//! `examples/hello/communicator`'s server/workers split from the original
//! C sources: one thread runs the zone's event loop, a pool of dispatcher
//! threads drains attached connections round robin.

use structopt::StructOpt;

use rpma::config::{Config, Flags};
use rpma::dispatcher::Dispatcher;
use rpma::zone::{TimeoutAction, Zone, ZoneEvent};
use rpma::Connection;

#[derive(StructOpt)]
struct Opt {
    #[structopt(long, default_value = "0.0.0.0")]
    addr: String,

    #[structopt(long, default_value = "7204")]
    service: String,

    #[structopt(long, default_value = "4")]
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

    let dispatchers: Vec<Dispatcher> = (0..opt.workers).map(|_| Dispatcher::new()).collect();
    let worker_threads: Vec<_> = dispatchers
        .iter()
        .cloned()
        .map(|disp| std::thread::spawn(move || disp.dispatch_loop()))
        .collect();

    let dispatchers_for_zone = dispatchers.clone();
    let mut next_worker = 0usize;
    zone.register_on_connection_event(move |zone, event| match event {
        ZoneEvent::Incoming => {
            let conn = Connection::new(zone)?;
            conn.register_on_recv(|conn, buf| {
                log::info!("echoing {} bytes", buf.len());
                let ptr = conn.msg_get_ptr();
                unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
                conn.send(ptr)
            });
            conn.accept()?;
            let disp = &dispatchers_for_zone[next_worker % dispatchers_for_zone.len()];
            next_worker = next_worker.wrapping_add(1);
            conn.attach(disp)
        }
        ZoneEvent::Disconnect(_) => {
            log::info!("client disconnected");
            Ok(())
        }
        ZoneEvent::Outgoing => unreachable!("server never fires Outgoing"),
    });

    zone.register_on_timeout(5000, |_zone| TimeoutAction::Continue)
        .unwrap();

    log::info!("listening");
    zone.wait_connections().expect("event loop failed");

    for disp in &dispatchers {
        disp.dispatch_break();
    }
    for handle in worker_threads {
        let _ = handle.join();
    }
}
