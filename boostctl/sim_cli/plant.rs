use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Turbo, wastegate and engine constants.
#[derive(Debug, Clone, Copy)]
pub struct PlantConfig {
    /// Boost reached with the solenoid off.
    pub spring_psi: f32,
    /// Extra boost per unit duty fraction at full spool.
    pub psi_per_duty: f32,
    /// First-order pneumatic time constant.
    pub lag_s: f32,
    /// Below this RPM the turbo makes no boost.
    pub spool_start_rpm: f32,
    /// At and above this RPM the turbo is fully spooled.
    pub spool_full_rpm: f32,
    /// Manifold pressure off throttle, gauge psi.
    pub vacuum_psi: f32,
    /// Torque without boost, Nm.
    pub base_torque_nm: f32,
    /// Torque gained per psi of boost, Nm.
    pub torque_per_psi: f32,
    /// Peak-to-peak sensor noise, psi.
    pub noise_psi: f32,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            spring_psi: 5.0,
            psi_per_duty: 30.0,
            lag_s: 0.15,
            spool_start_rpm: 1500.0,
            spool_full_rpm: 3000.0,
            vacuum_psi: -8.0,
            base_torque_nm: 150.0,
            torque_per_psi: 18.0,
            noise_psi: 0.02,
        }
    }
}

/// Engine and pneumatics driven by the solenoid duty.
#[derive(Debug, Clone)]
pub struct Plant {
    config: PlantConfig,
    manifold_psi: f32,
    creep_psi: f32,
    rng: SmallRng,
}

impl Plant {
    /// Creates a plant at atmospheric pressure with a deterministic noise seed.
    #[must_use]
    pub fn new(config: PlantConfig, seed: u64) -> Self {
        Self {
            config,
            manifold_psi: 0.0,
            creep_psi: 0.0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Adds boost the wastegate cannot bleed off (a sticking gate or a
    /// leaking dome line).
    pub fn set_creep(&mut self, psi: f32) {
        self.creep_psi = psi;
    }

    /// True manifold pressure, gauge psi.
    #[must_use]
    pub const fn manifold_psi(&self) -> f32 {
        self.manifold_psi
    }

    /// Engine torque at the current boost.
    #[must_use]
    pub fn torque_nm(&self) -> f32 {
        self.config
            .torque_per_psi
            .mul_add(self.manifold_psi.max(0.0), self.config.base_torque_nm)
    }

    /// Advances the plant by `dt_s` and returns the noisy sensed pressure.
    pub fn step(&mut self, duty_percent: f32, rpm: f32, under_load: bool, dt_s: f32) -> f32 {
        let cfg = self.config;
        let equilibrium = if under_load {
            let spool = ((rpm - cfg.spool_start_rpm) / (cfg.spool_full_rpm - cfg.spool_start_rpm))
                .clamp(0.0, 1.0);
            let duty = (duty_percent / 100.0).clamp(0.0, 1.0);
            spool * duty.mul_add(cfg.psi_per_duty, cfg.spring_psi) + self.creep_psi
        } else {
            cfg.vacuum_psi
        };
        let alpha = 1.0 - (-dt_s / cfg.lag_s.max(1e-3)).exp();
        self.manifold_psi += (equilibrium - self.manifold_psi) * alpha;
        let noise = if cfg.noise_psi > 0.0 {
            self.rng.gen_range(-cfg.noise_psi..=cfg.noise_psi) / 2.0
        } else {
            0.0
        };
        self.manifold_psi + noise
    }
}
