#![no_std]
#![no_main]

mod ble;
mod config;
mod ws2812;

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_nrf::{bind_interrupts, interrupt, peripherals, rng, spim};
use nrf_sdc::mpsl::MultiprotocolServiceLayer;
use nrf_sdc::{self as sdc, mpsl};
use relay_core::{ConnectionRegistry, IndicatorController, RelayConfig, RelayCore, RelayEvent};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use crate::ws2812::Ws2812;

bind_interrupts!(struct Irqs {
    RNG => rng::InterruptHandler<peripherals::RNG>;
    SWI0_EGU0 => mpsl::LowPrioInterruptHandler;
    CLOCK_POWER => mpsl::ClockInterruptHandler;
    RADIO => mpsl::HighPrioInterruptHandler;
    TIMER0 => mpsl::HighPrioInterruptHandler;
    RTC0 => mpsl::HighPrioInterruptHandler;
    SPIM3 => spim::InterruptHandler<peripherals::SPI3>;
});

/// How many outgoing L2CAP buffers per link
const L2CAP_TXQ: u8 = 3;

/// How many incoming L2CAP buffers per link
const L2CAP_RXQ: u8 = 3;

/// Size of L2CAP packets (ATT MTU 247 + 4)
const L2CAP_MTU: usize = 251;

fn build_sdc<'d, const N: usize>(
    p: sdc::Peripherals<'d>,
    rng: &'d mut rng::Rng<'d, peripherals::RNG>,
    mpsl: &'d MultiprotocolServiceLayer,
    mem: &'d mut sdc::Mem<N>,
) -> Result<sdc::SoftdeviceController<'d>, sdc::Error> {
    sdc::Builder::new()?
        .support_adv()?
        .support_peripheral()?
        .peripheral_count(config::MAX_CLIENTS as u8)?
        .buffer_cfg(L2CAP_MTU as u16, L2CAP_MTU as u16, L2CAP_TXQ, L2CAP_RXQ)?
        .build(p, rng, mpsl, mem)
}

static RELAY_EVENTS: ble::RelayEventChannel = ble::RelayEventChannel::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let mut c = embassy_nrf::config::Config::default();
    c.gpiote_interrupt_priority = interrupt::Priority::P2;
    c.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(c);

    info!("Relay node booting");

    let mpsl_p = mpsl::Peripherals::new(
        p.RTC0, p.TIMER0, p.TEMP, p.PPI_CH19, p.PPI_CH30, p.PPI_CH31,
    );
    let lfclk_cfg = mpsl::raw::mpsl_clock_lfclk_cfg_t {
        source: mpsl::raw::MPSL_CLOCK_LF_SRC_RC as u8,
        rc_ctiv: mpsl::raw::MPSL_RECOMMENDED_RC_CTIV as u8,
        rc_temp_ctiv: mpsl::raw::MPSL_RECOMMENDED_RC_TEMP_CTIV as u8,
        accuracy_ppm: mpsl::raw::MPSL_DEFAULT_CLOCK_ACCURACY_PPM as u16,
        skip_wait_lfclk_started: mpsl::raw::MPSL_DEFAULT_SKIP_WAIT_LFCLK_STARTED != 0,
    };
    static MPSL: StaticCell<MultiprotocolServiceLayer> = StaticCell::new();
    let mpsl = MPSL.init(unwrap!(mpsl::MultiprotocolServiceLayer::new(
        mpsl_p, Irqs, lfclk_cfg
    )));
    spawner.must_spawn(mpsl_task(mpsl));

    let sdc_p = sdc::Peripherals::new(
        p.PPI_CH17, p.PPI_CH18, p.PPI_CH20, p.PPI_CH21, p.PPI_CH22, p.PPI_CH23, p.PPI_CH24,
        p.PPI_CH25, p.PPI_CH26, p.PPI_CH27, p.PPI_CH28, p.PPI_CH29,
    );

    static RNG_CELL: StaticCell<rng::Rng<'static, peripherals::RNG>> = StaticCell::new();
    let rng = RNG_CELL.init(rng::Rng::new(p.RNG, Irqs));

    static SDC_MEM: StaticCell<sdc::Mem<16384>> = StaticCell::new();
    let sdc_mem = SDC_MEM.init(sdc::Mem::new());
    let sdc = unwrap!(build_sdc(sdc_p, rng, mpsl, sdc_mem));

    let relay_cfg = RelayConfig::default();

    // WS2812 data line on P0.16, driven by SPIM at 4 MHz (see ws2812.rs for
    // the bit encoding).
    let mut spim_config = spim::Config::default();
    spim_config.frequency = spim::Frequency::M4;
    let spim = spim::Spim::new_txonly_nosck(p.SPI3, Irqs, p.P0_16, spim_config);
    let pixel = Ws2812::new(spim, relay_cfg.brightness);

    spawner.must_spawn(ble::ble_task(spawner, sdc, &RELAY_EVENTS));
    spawner.must_spawn(relay_task(pixel, relay_cfg, &RELAY_EVENTS));
}

#[embassy_executor::task]
async fn mpsl_task(mpsl: &'static MultiprotocolServiceLayer<'static>) -> ! {
    mpsl.run().await
}

/// Owns the relay core and applies radio events one at a time. The activity
/// flash suspends only this task; events delivered meanwhile queue up.
#[embassy_executor::task]
async fn relay_task(
    pixel: Ws2812<'static, peripherals::SPI3>,
    cfg: RelayConfig,
    events: &'static ble::RelayEventChannel,
) -> ! {
    let mut core = RelayCore::new(
        ConnectionRegistry::new(cfg.max_clients),
        IndicatorController::new(pixel, embassy_time::Delay, cfg.flash_duration_ms),
        ble::RadioHandle,
    );
    core.start().await;
    info!(
        "Ready: advertising as {=str}, up to {=u32} clients",
        config::DEVICE_NAME,
        cfg.max_clients
    );

    loop {
        let event = events.receive().await;
        let is_link_event = matches!(
            event,
            RelayEvent::ClientConnected | RelayEvent::ClientDisconnected
        );
        if let RelayEvent::DataReceived(payload) = &event {
            info!("Relaying {=usize} bytes", payload.len());
        }
        if core.handle(event).await.is_err() {
            defmt::error!(
                "Disconnect with no client attached (platform double-fire), count stays 0 ({=u32} so far)",
                core.stats().underflows
            );
        }
        if is_link_event {
            info!("Clients attached: {=u32}", core.client_count());
        }
    }
}
