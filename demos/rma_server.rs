//! Registers a destination region, publishes its `MemoryId` to the client
//! over the messaging channel, then prints whatever the client's `write` +
//! `commit` landed in it once the client's follow-up ack message arrives,
//! grounded on the write/commit durability scenario of spec.md §8
//! (scenario 4). `commit`'s own read completion is local to the writer
//! (routed to `on_notify` there, §4.3) — the peer learns the write landed
//! only through an explicit follow-up message, same as any two-sided
//! acknowledgement.

use std::sync::{Arc, Mutex};

use structopt::StructOpt;

use rpma::config::{Config, Flags};
use rpma::dispatcher::Dispatcher;
use rpma::memory::{Access, MemoryLocal};
use rpma::zone::{TimeoutAction, Zone, ZoneEvent};
use rpma::Connection;

const REGION_SIZE: usize = 4096;

#[derive(StructOpt)]
struct Opt {
    #[structopt(long, default_value = "0.0.0.0")]
    addr: String,

    #[structopt(long, default_value = "7205")]
    service: String,
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
    let disp = Dispatcher::new();
    let worker = {
        let disp = disp.clone();
        std::thread::spawn(move || disp.dispatch_loop())
    };

    zone.register_on_connection_event({
        let disp = disp.clone();
        move |zone, event| match event {
            ZoneEvent::Incoming => {
                let conn = Connection::new(zone)?;

                let region = vec![0u8; REGION_SIZE].into_boxed_slice();
                let region_ptr = Box::into_raw(region) as *mut u8;
                let mr = Arc::new(Mutex::new(unsafe {
                    MemoryLocal::new(zone, region_ptr, REGION_SIZE, Access::WRITE_DST)?
                }));

                conn.register_on_recv({
                    let mr = mr.clone();
                    move |conn, _ack| {
                        let guard = mr.lock().unwrap();
                        let bytes = unsafe { guard.as_slice() };
                        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                        log::info!("committed region now reads: {:?}", &bytes[..end]);
                        conn.zone().wait_break();
                        Ok(())
                    }
                });

                conn.accept()?;

                let id = mr.lock().unwrap().id();
                let ptr = conn.msg_get_ptr();
                unsafe { std::ptr::copy_nonoverlapping(id.to_bytes().as_ptr(), ptr, 24) };
                conn.send(ptr)?;

                // Only attach once this send's own completion has already
                // been consumed: the dispatcher's worker thread starts
                // draining this connection's CQ concurrently the instant
                // it's attached.
                conn.attach(&disp)
            }
            ZoneEvent::Disconnect(_) => {
                log::info!("client disconnected");
                Ok(())
            }
            ZoneEvent::Outgoing => unreachable!("server never fires Outgoing"),
        }
    });

    zone.register_on_timeout(10_000, |_zone| TimeoutAction::Continue)
        .unwrap();

    log::info!("listening");
    zone.wait_connections().expect("event loop failed");

    disp.dispatch_break();
    let _ = worker.join();
}
