//! Connects to `rma_server`, receives the server's region `MemoryId`,
//! writes `"HELLO"` into it, calls `commit` to flush the write to the
//! remote NIC, then sends an ack so the server can print what landed —
//! grounded on the write/commit durability scenario of spec.md §8
//! (scenario 4).

use structopt::StructOpt;

use rpma::config::Config;
use rpma::dispatcher::Dispatcher;
use rpma::memory::{Access, MemoryId, MemoryLocal, MemoryRemote};
use rpma::zone::{TimeoutAction, Zone, ZoneEvent};
use rpma::Connection;

const PAYLOAD: &[u8] = b"HELLO";

#[derive(StructOpt)]
struct Opt {
    #[structopt(long, default_value = "127.0.0.1")]
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

                let mut src = PAYLOAD.to_vec();
                src.resize(4096, 0);
                let src = src.into_boxed_slice();
                let src_ptr = Box::into_raw(src) as *mut u8;
                let local = unsafe { MemoryLocal::new(zone, src_ptr, 4096, Access::WRITE_SRC)? };

                conn.register_on_recv(move |conn, buf| {
                    let id = MemoryId::from_bytes(buf)?;
                    let remote = MemoryRemote::new(id)?;

                    conn.write(&remote, 0, &local, 0, PAYLOAD.len())?;
                    conn.commit()?;
                    log::info!("commit() returned: write is visible at the remote NIC");

                    let ptr = conn.msg_get_ptr();
                    conn.send(ptr)?;
                    conn.zone().wait_break();
                    Ok(())
                });

                conn.establish()?;
                // Nothing has been sent on this connection yet, so attaching
                // here can't race a synchronous send's own completion wait.
                conn.attach(&disp)
            }
            ZoneEvent::Incoming => unreachable!("client never fires Incoming"),
            ZoneEvent::Disconnect(_) => {
                log::info!("server disconnected");
                Ok(())
            }
        }
    });

    zone.register_on_timeout(10_000, |_zone| TimeoutAction::Continue)
        .unwrap();

    zone.wait_connections().expect("event loop failed");

    disp.dispatch_break();
    let _ = worker.join();
}
