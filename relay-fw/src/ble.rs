//! BLE peripheral: the relay GATT service over trouble-host.
//!
//! One advertiser task hands accepted connections to a pool of per-client
//! tasks. Client writes and link events are funneled into the relay dispatch
//! channel; broadcasts fan out through per-client queues so every attached
//! client sees every payload in write order.

use defmt::{info, warn};
use embassy_executor::Spawner;
use embassy_futures::join::join;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use relay_core::{Payload, Radio, RelayEvent};
use static_cell::StaticCell;
use trouble_host::prelude::*;

use crate::config::{
    CLIENT_QUEUE_DEPTH, DEVICE_NAME, EVENT_QUEUE_DEPTH, MAX_CLIENTS, RELAY_SERVICE_UUID,
};

/// Max number of connections
const CONNECTIONS_MAX: usize = MAX_CLIENTS;

/// Max number of L2CAP channels (signal + att).
const L2CAP_CHANNELS_MAX: usize = 2;

pub type Controller = nrf_sdc::SoftdeviceController<'static>;
type Pool = DefaultPacketPool;
type Resources = HostResources<Pool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX>;

/// Channel feeding the relay dispatch task.
pub type RelayEventChannel = Channel<ThreadModeRawMutex, RelayEvent, EVENT_QUEUE_DEPTH>;

/// Per-client outbound queue.
pub type ClientQueue = Channel<ThreadModeRawMutex, Payload, CLIENT_QUEUE_DEPTH>;

/// One queue per potential client connection.
static QUEUE_POOL: [ClientQueue; MAX_CLIENTS] = [
    Channel::new(),
    Channel::new(),
    Channel::new(),
    Channel::new(),
];

/// Armed by the relay whenever discoverability should resume. Advertising is
/// single-shot (it stops when a central connects), so every connect and
/// disconnect decision re-arms this explicitly.
static ADV_ENABLE: Signal<ThreadModeRawMutex, ()> = Signal::new();

/// Occupancy of the client queue pool.
pub struct ClientQueues {
    occupied: AsyncMutex<ThreadModeRawMutex, [bool; MAX_CLIENTS]>,
}

impl ClientQueues {
    pub const fn new() -> Self {
        Self {
            occupied: AsyncMutex::new([false; MAX_CLIENTS]),
        }
    }

    /// Claim a free slot, draining anything a previous client left behind.
    pub async fn acquire(&self) -> Option<usize> {
        let mut occupied = self.occupied.lock().await;
        for (slot, used) in occupied.iter_mut().enumerate() {
            if !*used {
                *used = true;
                while QUEUE_POOL[slot].try_receive().is_ok() {}
                return Some(slot);
            }
        }
        None
    }

    pub async fn release(&self, slot: usize) {
        let mut occupied = self.occupied.lock().await;
        occupied[slot] = false;
    }

    /// Fan a payload out to every attached client, in order.
    pub async fn broadcast(&self, payload: &[u8]) {
        let occupied = self.occupied.lock().await;
        for (slot, used) in occupied.iter().enumerate() {
            if *used {
                let Ok(copy) = Payload::from_slice(payload) else {
                    continue;
                };
                QUEUE_POOL[slot].send(copy).await;
            }
        }
    }
}

static CLIENT_QUEUES: ClientQueues = ClientQueues::new();

/// The relay core's view of the radio.
pub struct RadioHandle;

impl Radio for RadioHandle {
    async fn notify_all(&mut self, payload: &[u8]) {
        CLIENT_QUEUES.broadcast(payload).await;
    }

    fn start_advertising(&mut self) {
        ADV_ENABLE.signal(());
    }
}

// GATT Server definition
#[gatt_server]
pub struct Server {
    pub relay: RelayService,
}

/// Relay service: a single characteristic carrying opaque payloads. Clients
/// write frames here and subscribe to notifications of everyone's writes.
#[gatt_service(uuid = "4fafc201-1fb5-459e-8fcc-c5c9c331914b")]
pub struct RelayService {
    /// Last relayed payload.
    #[characteristic(
        uuid = "beb5483e-36e1-4688-b7f5-ea07361b26a8",
        read,
        write,
        write_without_response,
        notify
    )]
    pub payload: Payload,
}

/// Run the BLE stack.
#[embassy_executor::task]
pub async fn ble_task(
    spawner: Spawner,
    controller: Controller,
    events: &'static RelayEventChannel,
) {
    let address = Address::random(device_id());
    info!("BLE address {:?}", defmt::Debug2Format(&address));

    static RESOURCES: StaticCell<Resources> = StaticCell::new();
    let resources = RESOURCES.init(HostResources::new());

    static STACK: StaticCell<Stack<'static, Controller, Pool>> = StaticCell::new();
    let stack = STACK.init(trouble_host::new(controller, resources).set_random_address(address));

    let Host {
        mut peripheral,
        runner,
        ..
    } = stack.build();

    static SERVER: StaticCell<Server<'static>> = StaticCell::new();
    let server = SERVER.init(defmt::unwrap!(Server::new_with_config(GapConfig::Peripheral(
        PeripheralConfig {
            name: DEVICE_NAME,
            appearance: &appearance::power_device::GENERIC_POWER_DEVICE,
        }
    ))));

    join(runner_task(runner), async {
        loop {
            // The relay arms discoverability at boot and after every event
            // that leaves a free slot; block until it does.
            ADV_ENABLE.wait().await;

            match advertise(&mut peripheral, server).await {
                Ok(conn) => {
                    // Advertising auto-stopped when this link came up. Clear
                    // any re-arm latched mid-advertise; the relay decides
                    // afresh once it has counted this client.
                    ADV_ENABLE.reset();

                    let Some(slot) = CLIENT_QUEUES.acquire().await else {
                        warn!("No free client slot, dropping connection");
                        let _ = conn.raw().disconnect();
                        continue;
                    };
                    info!("Connection accepted (slot {})", slot);
                    spawner.must_spawn(client_task(conn, slot, server, events));
                    events.send(RelayEvent::ClientConnected).await;
                }
                Err(e) => {
                    warn!("Advertise error (will retry): {:?}", defmt::Debug2Format(&e));
                    Timer::after_millis(250).await;
                    ADV_ENABLE.signal(());
                }
            }
        }
    })
    .await;
}

/// This task must run forever alongside any other BLE work.
async fn runner_task(mut runner: Runner<'static, Controller, Pool>) {
    loop {
        if let Err(e) = runner.run().await {
            defmt::error!("BLE host error: {:?}", defmt::Debug2Format(&e));
        }
    }
}

/// Advertise until a central connects, then hand back the connection.
async fn advertise(
    peripheral: &mut Peripheral<'static, Controller, Pool>,
    server: &'static Server<'static>,
) -> Result<GattConnection<'static, 'static, Pool>, BleHostError<nrf_sdc::Error>> {
    let mut advertiser_data = [0; 31];
    let mut scan_rsp_data = [0; 31];

    let adv_len = AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids128(&[RELAY_SERVICE_UUID.to_le_bytes()]),
        ],
        &mut advertiser_data[..],
    )?;
    let scan_len = AdStructure::encode_slice(
        &[AdStructure::CompleteLocalName(DEVICE_NAME.as_bytes())],
        &mut scan_rsp_data[..],
    )?;

    let advertiser = peripheral
        .advertise(
            &Default::default(),
            Advertisement::ConnectableScannableUndirected {
                adv_data: &advertiser_data[..adv_len],
                scan_data: &scan_rsp_data[..scan_len],
            },
        )
        .await?;
    info!("Advertising, waiting for connection...");
    let conn = advertiser.accept().await?.with_attribute_server(server)?;
    Ok(conn)
}

/// Per-client task: forwards writes to the dispatcher and drains this
/// client's share of the broadcast fan-out into notifications.
#[embassy_executor::task(pool_size = MAX_CLIENTS)]
async fn client_task(
    conn: GattConnection<'static, 'static, Pool>,
    slot: usize,
    server: &'static Server<'static>,
    events: &'static RelayEventChannel,
) {
    let payload_char = &server.relay.payload;
    let queue = &QUEUE_POOL[slot];

    let gatt_fut = async {
        loop {
            match conn.next().await {
                GattConnectionEvent::Disconnected { reason } => {
                    info!("Disconnected: {:?}", defmt::Debug2Format(&reason));
                    break;
                }
                GattConnectionEvent::Gatt { event } => {
                    let mut incoming: Option<Payload> = None;
                    if let GattEvent::Write(write) = &event {
                        if write.handle() == payload_char.handle {
                            match Payload::from_slice(write.data()) {
                                Ok(payload) => incoming = Some(payload),
                                // Cannot arrive through a 247-byte ATT MTU;
                                // drop rather than truncate if it ever does.
                                Err(()) => warn!("Oversized write dropped"),
                            }
                        }
                    }
                    match event.accept() {
                        Ok(reply) => reply.send().await,
                        Err(e) => warn!("GATT reply error: {:?}", defmt::Debug2Format(&e)),
                    }
                    if let Some(payload) = incoming {
                        events.send(RelayEvent::DataReceived(payload)).await;
                    }
                }
                _ => {
                    // MTU exchange, PHY updates and friends.
                }
            }
        }
    };

    let notify_fut = async {
        loop {
            let payload = queue.receive().await;
            if let Err(e) = payload_char.notify(&conn, &payload).await {
                warn!("Notify failed: {:?}", defmt::Debug2Format(&e));
                break;
            }
        }
    };

    match select(gatt_fut, notify_fut).await {
        Either::First(()) => {}
        Either::Second(()) => {
            // Notify pump died first; drop the link rather than keep a
            // client that can no longer be reached.
            let _ = conn.raw().disconnect();
        }
    }

    CLIENT_QUEUES.release(slot).await;
    events.send(RelayEvent::ClientDisconnected).await;
}

fn device_id() -> [u8; 6] {
    let ficr = embassy_nrf::pac::FICR;
    let low = ficr.deviceid(0).read();
    let high = ficr.deviceid(1).read();
    let [a, b, c, d] = low.to_le_bytes();
    let [e, f, ..] = high.to_le_bytes();
    [a, b, c, d, e, f]
}
