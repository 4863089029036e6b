//! Shared rig: a coordinator wired to a simulated ISOBUS line.
//!
//! Addresses follow `config/cryomag.toml`.

#![allow(dead_code)]

use std::sync::Arc;

use cryo_hardware::drivers::{Ips120, Itc503, MagnetSupply, OxfordValve, Ps120};
use cryo_hardware::sim::{SimHandle, SimIps120, SimItc503, SimPs120, SimValve};
use cryomag::config::CryomagConfig;
use cryomag::coordinator::{DeviceCluster, VectorMagnet};

pub const SUPPLY_X: u8 = 1;
pub const SUPPLY_Y: u8 = 2;
pub const SUPPLY_Z: u8 = 3;
/// Sensors: 1 sorb, 2 heat switch, 3 magnet
pub const ITC_SORB: u8 = 4;
/// Sensors: 1 pot low range, 2 pot high range
pub const ITC_POT: u8 = 5;
/// Sensors: 1 PT1, 2 PT2, 3 intermediate plate
pub const ITC_PLATES: u8 = 6;
pub const VALVE: u8 = 7;

pub fn config() -> CryomagConfig {
    CryomagConfig::from_toml_str(include_str!("../../config/cryomag.toml")).unwrap()
}

/// Controllers at rest: sorb 10 K, heat switch 5 K, magnet 3.9 K, pot
/// 0.5 K (low range), PT1 40 K, PT2 3.5 K, intermediate plate 1.2 K.
pub fn quiet_controllers() -> [SimItc503; 3] {
    [
        SimItc503::new([10.0, 5.0, 3.9]),
        SimItc503::new([0.5, 0.6, 0.0]),
        SimItc503::new([40.0, 3.5, 1.2]),
    ]
}

pub struct Rig {
    pub sim: SimHandle,
    pub magnet: Arc<VectorMagnet>,
}

impl Rig {
    /// Builds and initializes the coordinator, then clears the journal.
    pub async fn start(controllers: [SimItc503; 3]) -> Rig {
        Self::start_with(config(), controllers).await
    }

    pub async fn start_with(config: CryomagConfig, controllers: [SimItc503; 3]) -> Rig {
        let sim = SimHandle::new();
        sim.attach(SUPPLY_X, SimIps120::new());
        sim.attach(SUPPLY_Y, SimIps120::new());
        sim.attach(SUPPLY_Z, SimPs120::new());
        let [sorb, pot, plates] = controllers;
        sim.attach(ITC_SORB, sorb);
        sim.attach(ITC_POT, pot);
        sim.attach(ITC_PLATES, plates);
        sim.attach(VALVE, SimValve::new());

        let supplies: [Box<dyn MagnetSupply>; 3] = [
            Box::new(Ips120::with_transport(sim.transport("IPS120 x", SUPPLY_X))),
            Box::new(Ips120::with_transport(sim.transport("IPS120 y", SUPPLY_Y))),
            Box::new(Ps120::with_transport(sim.transport("PS120 z", SUPPLY_Z))),
        ];
        let controllers = [
            Itc503::with_transport(sim.transport("ITC503 sorb", ITC_SORB)),
            Itc503::with_transport(sim.transport("ITC503 pot", ITC_POT)),
            Itc503::with_transport(sim.transport("ITC503 plates", ITC_PLATES)),
        ];
        let valve = OxfordValve::with_transport(sim.transport("V1", VALVE), 1, true).unwrap();

        let cluster = DeviceCluster::new(supplies, controllers, valve);
        let magnet = Arc::new(VectorMagnet::with_cluster(config, cluster).unwrap());
        magnet.initialize().await.unwrap();
        sim.clear_journal();
        Rig { sim, magnet }
    }

    pub fn commands(&self, address: u8) -> Vec<String> {
        self.sim.commands_for(address)
    }

    /// Addresses of journal entries whose command starts with one of
    /// `verbs`, in the order they hit the line.
    pub fn order_of(&self, verbs: &[char]) -> Vec<u8> {
        self.sim
            .journal()
            .into_iter()
            .filter(|e| e.command.chars().next().is_some_and(|c| verbs.contains(&c)))
            .filter_map(|e| e.address)
            .collect()
    }

    pub fn field_x(&self) -> f64 {
        self.sim.with_device(SUPPLY_X, |d: &mut SimIps120| d.field()).unwrap()
    }
}
