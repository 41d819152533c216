//! Process-wide, read-only channel metadata.
//!
//! The registry is built once and never mutated afterwards, mirroring the
//! "global mutable state becomes an immutable table" design note: callers
//! get `&'static` references out of [`ChannelRegistry::global`], never an
//! owned, independently-mutable copy of a single entry.

use std::sync::OnceLock;

/// Logical owner of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelGroup {
    PostA,
    PostB,
    PostC,
    Common,
    System,
}

/// Physical quantity a channel measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    Pressure,
    Temperature,
    Electrical,
    Flow,
    Humidity,
    CurrentLoop,
    System,
}

/// Immutable metadata for one of the 134 canonical channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDefinition {
    pub index: u16,
    pub name: String,
    pub unit: String,
    pub description: String,
    pub group: ChannelGroup,
    pub physical_type: PhysicalType,
    pub min_limit: Option<f64>,
    pub max_limit: Option<f64>,
}

/// The four dense index ranges the registry is documented to occupy.
pub const INDEX_RANGES: [(u16, u16); 4] = [(0, 15), (16, 91), (100, 137), (146, 149)];

pub const CHANNEL_COUNT: usize = 134;

/// Read-only, process-wide table of channel metadata plus the protocol
/// position -> registry index permutation (spec.md S4.1).
pub struct ChannelRegistry {
    by_index: Vec<Option<ChannelDefinition>>,
    protocol_order: [u16; CHANNEL_COUNT],
}

impl ChannelRegistry {
    /// Returns the single process-wide instance, building it on first use.
    pub fn global() -> &'static ChannelRegistry {
        static INSTANCE: OnceLock<ChannelRegistry> = OnceLock::new();
        INSTANCE.get_or_init(ChannelRegistry::build)
    }

    /// Looks up a channel definition by registry index.
    pub fn by_index(&self, index: u16) -> Option<&ChannelDefinition> {
        self.by_index.get(index as usize).and_then(|e| e.as_ref())
    }

    /// Short name for a channel, falling back to `"v" + zero-padded index`
    /// for indices with no registered definition (e.g. unused slots in the
    /// sparse ranges).
    pub fn name(&self, index: u16) -> String {
        match self.by_index(index) {
            Some(def) => def.name.clone(),
            None => format!("v{index:03}"),
        }
    }

    pub fn unit(&self, index: u16) -> String {
        match self.by_index(index) {
            Some(def) => def.unit.clone(),
            None => String::new(),
        }
    }

    /// Returns a fresh copy of the fixed position -> registry index
    /// permutation used to remap tagged-frame payload positions.
    pub fn protocol_order(&self) -> [u16; CHANNEL_COUNT] {
        self.protocol_order
    }

    /// Maps one tagged-frame payload position (0..134) to its registry
    /// index, per spec.md S4.1.
    pub fn position_to_index(&self, position: usize) -> Option<u16> {
        self.protocol_order.get(position).copied()
    }

    /// All registry indices belonging to `group`, in ascending order. Used
    /// to derive a post's default channel selection (one post owns exactly
    /// one `ChannelGroup`, plus none of the `Common`/`System` channels).
    pub fn indices_in_group(&self, group: ChannelGroup) -> Vec<u16> {
        self.by_index
            .iter()
            .filter_map(|e| e.as_ref())
            .filter(|def| def.group == group)
            .map(|def| def.index)
            .collect()
    }

    fn build() -> ChannelRegistry {
        let mut by_index = vec![None; 150];
        let mut push = |idx: u16, name: String, unit: &str, desc: &str, group: ChannelGroup, ty: PhysicalType, min: Option<f64>, max: Option<f64>| {
            by_index[idx as usize] = Some(ChannelDefinition {
                index: idx,
                name,
                unit: unit.to_string(),
                description: desc.to_string(),
                group,
                physical_type: ty,
                min_limit: min,
                max_limit: max,
            });
        };

        // 0-5: System group, one diagnostic channel per slot.
        let system_names = [
            ("sys_status", "", "System status word"),
            ("sys_heartbeat", "Hz", "Transmitter heartbeat rate"),
            ("sys_supply_v", "V", "Internal supply voltage"),
            ("sys_supply_i", "A", "Internal supply current"),
            ("sys_cpu_temp", "degC", "Transmitter CPU temperature"),
            ("sys_aux", "", "Reserved auxiliary diagnostic"),
        ];
        for (i, (name, unit, desc)) in system_names.iter().enumerate() {
            push(i as u16, name.to_string(), unit, desc, ChannelGroup::System, PhysicalType::System, None, None);
        }

        // 6-15: Common group, shared bench-level sensors.
        let common_defs: [(&str, &str, &str, PhysicalType); 10] = [
            ("ambient_pressure", "bar", "Ambient barometric pressure", PhysicalType::Pressure),
            ("ambient_temp", "degC", "Ambient air temperature", PhysicalType::Temperature),
            ("coolant_flow", "L/min", "Bench coolant flow rate", PhysicalType::Flow),
            ("ambient_humidity", "%RH", "Ambient relative humidity", PhysicalType::Humidity),
            ("supply_loop_1", "mA", "Bench 4-20mA supply loop 1", PhysicalType::CurrentLoop),
            ("supply_loop_2", "mA", "Bench 4-20mA supply loop 2", PhysicalType::CurrentLoop),
            ("bench_pressure_ref", "bar", "Reference pressure transducer", PhysicalType::Pressure),
            ("bench_temp_ref", "degC", "Reference thermocouple", PhysicalType::Temperature),
            ("rig_vibration", "g", "Rig vibration sensor", PhysicalType::Electrical),
            ("rig_noise", "dB", "Rig acoustic level", PhysicalType::Electrical),
        ];
        for (i, (name, unit, desc, ty)) in common_defs.iter().enumerate() {
            push((6 + i) as u16, name.to_string(), unit, desc, ChannelGroup::Common, *ty, None, None);
        }

        // 16-47: Post A temperatures (32 channels).
        for i in 0..32u16 {
            let idx = 16 + i;
            push(
                idx,
                format!("postA_temp_{i:02}"),
                "degC",
                "Post A process temperature",
                ChannelGroup::PostA,
                PhysicalType::Temperature,
                Some(-20.0),
                Some(150.0),
            );
        }

        // 48-53: Post A electrical (6 channels).
        for i in 0..6u16 {
            let idx = 48 + i;
            push(
                idx,
                format!("postA_elec_{i:02}"),
                "A",
                "Post A electrical measurement",
                ChannelGroup::PostA,
                PhysicalType::Electrical,
                Some(0.0),
                Some(50.0),
            );
        }

        // 54-85: Post B temperatures (32 channels).
        for i in 0..32u16 {
            let idx = 54 + i;
            push(
                idx,
                format!("postB_temp_{i:02}"),
                "degC",
                "Post B process temperature",
                ChannelGroup::PostB,
                PhysicalType::Temperature,
                Some(-20.0),
                Some(150.0),
            );
        }

        // 86-91: Post B electrical (6 channels).
        for i in 0..6u16 {
            let idx = 86 + i;
            push(
                idx,
                format!("postB_elec_{i:02}"),
                "A",
                "Post B electrical measurement",
                ChannelGroup::PostB,
                PhysicalType::Electrical,
                Some(0.0),
                Some(50.0),
            );
        }

        // 100-131: Post C temperatures (32 channels).
        for i in 0..32u16 {
            let idx = 100 + i;
            push(
                idx,
                format!("postC_temp_{i:02}"),
                "degC",
                "Post C process temperature",
                ChannelGroup::PostC,
                PhysicalType::Temperature,
                Some(-20.0),
                Some(150.0),
            );
        }

        // 132-137: Post C electrical (6 channels).
        for i in 0..6u16 {
            let idx = 132 + i;
            push(
                idx,
                format!("postC_elec_{i:02}"),
                "A",
                "Post C electrical measurement",
                ChannelGroup::PostC,
                PhysicalType::Electrical,
                Some(0.0),
                Some(50.0),
            );
        }

        // 146-149: Common, one of each remaining physical type.
        push(146, "bench_flow_total".to_string(), "L/min", "Bench total flow", ChannelGroup::Common, PhysicalType::Flow, Some(0.0), Some(500.0));
        push(147, "bench_humidity_aux".to_string(), "%RH", "Auxiliary humidity probe", ChannelGroup::Common, PhysicalType::Humidity, None, None);
        push(148, "bench_loop_aux".to_string(), "mA", "Auxiliary 4-20mA loop", ChannelGroup::Common, PhysicalType::CurrentLoop, Some(4.0), Some(20.0));
        push(149, "bench_diag".to_string(), "", "Bench diagnostic word", ChannelGroup::Common, PhysicalType::System, None, None);

        let protocol_order = build_protocol_order();

        ChannelRegistry {
            by_index,
            protocol_order,
        }
    }
}

/// Builds the fixed position -> registry index permutation documented in
/// spec.md S4.1.
fn build_protocol_order() -> [u16; CHANNEL_COUNT] {
    let mut order = [0u16; CHANNEL_COUNT];

    // 0-5 identity, 6-15 identity (common).
    for p in 0..16usize {
        order[p] = p as u16;
    }
    // 16-47 identity (Post A temperatures).
    for p in 16..48usize {
        order[p] = p as u16;
    }
    // 48-79 -> registry 54-85 (Post B temperatures).
    for p in 48..80usize {
        order[p] = (54 + (p - 48)) as u16;
    }
    // 80-111 -> registry 100-131 (Post C).
    for p in 80..112usize {
        order[p] = (100 + (p - 80)) as u16;
    }
    // 112-117 -> registry 48-53 (Post A electrical).
    for p in 112..118usize {
        order[p] = (48 + (p - 112)) as u16;
    }
    // 118-123 -> registry 86-91.
    for p in 118..124usize {
        order[p] = (86 + (p - 118)) as u16;
    }
    // 124-129 -> registry 132-137.
    for p in 124..130usize {
        order[p] = (132 + (p - 124)) as u16;
    }
    // 130-133 -> registry 146-149.
    for p in 130..134usize {
        order[p] = (146 + (p - 130)) as u16;
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_exactly_134_entries() {
        let reg = ChannelRegistry::global();
        let count = reg.by_index.iter().filter(|e| e.is_some()).count();
        assert_eq!(count, CHANNEL_COUNT);
    }

    #[test]
    fn protocol_order_is_a_permutation_of_defined_indices() {
        let reg = ChannelRegistry::global();
        let order = reg.protocol_order();
        assert_eq!(order.len(), CHANNEL_COUNT);
        let mut seen = std::collections::HashSet::new();
        for idx in order {
            assert!(reg.by_index(idx).is_some(), "position maps to undefined index {idx}");
            assert!(seen.insert(idx), "duplicate registry index {idx} in protocol order");
        }
    }

    #[test]
    fn identity_region_maps_straight_through() {
        let reg = ChannelRegistry::global();
        for p in 0..48usize {
            assert_eq!(reg.position_to_index(p), Some(p as u16));
        }
    }

    #[test]
    fn post_b_region_remaps_to_54_85() {
        let reg = ChannelRegistry::global();
        assert_eq!(reg.position_to_index(48), Some(54));
        assert_eq!(reg.position_to_index(79), Some(85));
    }

    #[test]
    fn post_c_region_remaps_to_100_131() {
        let reg = ChannelRegistry::global();
        assert_eq!(reg.position_to_index(80), Some(100));
        assert_eq!(reg.position_to_index(111), Some(131));
    }

    #[test]
    fn tail_regions_remap_correctly() {
        let reg = ChannelRegistry::global();
        assert_eq!(reg.position_to_index(112), Some(48));
        assert_eq!(reg.position_to_index(117), Some(53));
        assert_eq!(reg.position_to_index(118), Some(86));
        assert_eq!(reg.position_to_index(123), Some(91));
        assert_eq!(reg.position_to_index(124), Some(132));
        assert_eq!(reg.position_to_index(129), Some(137));
        assert_eq!(reg.position_to_index(130), Some(146));
        assert_eq!(reg.position_to_index(133), Some(149));
    }

    #[test]
    fn name_falls_back_to_v_prefixed_index_for_unmapped_slots() {
        let reg = ChannelRegistry::global();
        assert_eq!(reg.name(92), "v092");
    }

    #[test]
    fn indices_in_group_covers_post_a_temps_and_electrical() {
        let reg = ChannelRegistry::global();
        let post_a = reg.indices_in_group(ChannelGroup::PostA);
        assert_eq!(post_a.len(), 38);
        assert!(post_a.contains(&16));
        assert!(post_a.contains(&53));
        assert!(!post_a.contains(&54));
    }

    #[test]
    fn indices_are_dense_within_documented_ranges() {
        let reg = ChannelRegistry::global();
        for (lo, hi) in INDEX_RANGES {
            for idx in lo..=hi {
                assert!(reg.by_index(idx).is_some(), "index {idx} in range {lo}..={hi} is missing");
            }
        }
    }
}
