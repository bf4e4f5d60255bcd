//! Connects to `hello_server`, sends one `msg_size`-byte payload, and waits
//! for the echoed reply, grounded on the loopback send/recv scenario of
//! spec.md §8 (scenario 3).

use structopt::StructOpt;

use rpma::config::Config;
use rpma::dispatcher::Dispatcher;
use rpma::zone::{TimeoutAction, Zone, ZoneEvent};
use rpma::Connection;

#[derive(StructOpt)]
struct Opt {
    #[structopt(long, default_value = "127.0.0.1")]
    addr: String,

    #[structopt(long, default_value = "7204")]
    service: String,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let cfg = Config::new()
        .set_addr(opt.addr)
        .unwrap()
        .set_service(opt.service)
        .unwrap();

    let zone = Zone::new(&cfg).expect("zone setup failed");
    let disp = Dispatcher::new();
    let worker = {
        let disp = disp.clone();
        std::thread::spawn(move || disp.dispatch_loop())
    };

    zone.register_on_connection_event({
        let disp = disp.clone();
        move |zone, event| match event {
            ZoneEvent::Outgoing => {
                let conn = Connection::new(zone)?;
                conn.register_on_recv(|conn, buf| {
                    log::info!("received {} bytes", buf.len());
                    println!("reply: {:?}", &buf[..14]);
                    conn.zone().wait_break();
                    Ok(())
                });
                conn.establish()?;

                let ptr = conn.msg_get_ptr();
                let payload = b"Hello, world!\0";
                unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
                conn.send(ptr)?;

                // Only attach after the synchronous send above has settled its
                // own completion: the dispatcher's worker thread starts
                // draining this connection's CQ concurrently the moment it's
                // attached, and a send still in flight on this thread would
                // race it for the same completion.
                conn.attach(&disp)
            }
            ZoneEvent::Incoming => unreachable!("client never fires Incoming"),
            ZoneEvent::Disconnect(_) => {
                log::info!("server disconnected");
                Ok(())
            }
        }
    });

    zone.register_on_timeout(5000, |_zone| TimeoutAction::Continue)
        .unwrap();

    zone.wait_connections().expect("event loop failed");

    disp.dispatch_break();
    let _ = worker.join();
}
