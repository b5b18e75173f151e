//! The virtual GATT table (§4.3): an ordered sequence of Services, each
//! owning an ordered sequence of Characteristics with a property bitset.
//! Built once at init; the protocol layer never mutates it.

use crate::uuid::{well_known, Uuid128};

pub const PROP_READ: u8 = 0x01;
pub const PROP_WRITE: u8 = 0x02;
pub const PROP_NOTIFY: u8 = 0x04;
pub const PROP_MASK: u8 = 0x07;

#[derive(Debug, Clone)]
pub struct Characteristic {
    pub uuid128: Uuid128,
    pub properties: u8,
}

impl Characteristic {
    pub fn new(uuid16: u16, properties: u8) -> Self {
        Characteristic {
            uuid128: Uuid128::from_u16(uuid16),
            properties: properties & PROP_MASK,
        }
    }

    pub fn uuid16(&self) -> Option<u16> {
        self.uuid128.to_u16()
    }

    pub fn supports(&self, flag: u8) -> bool {
        self.properties & flag != 0
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    pub uuid128: Uuid128,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    fn new(uuid16: u16) -> Self {
        Service {
            uuid128: Uuid128::from_u16(uuid16),
            characteristics: Vec::new(),
        }
    }

    fn add_char(&mut self, uuid16: u16, properties: u8) -> &Characteristic {
        self.characteristics.push(Characteristic::new(uuid16, properties));
        self.characteristics.last().unwrap()
    }

    pub fn find_char(&self, uuid: &Uuid128) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| Uuid128::eq(&c.uuid128, uuid))
    }
}

/// The GATT table: Cycling Power Service + Fitness Machine Service, with
/// exactly the characteristics and properties the emulator exposes.
#[derive(Debug, Clone)]
pub struct GattTable {
    pub services: Vec<Service>,
}

impl GattTable {
    pub fn build() -> Self {
        let mut cps = Service::new(well_known::CYCLING_POWER_SERVICE.0);
        cps.add_char(well_known::CYCLING_POWER_MEASUREMENT.0, PROP_NOTIFY);
        cps.add_char(well_known::CYCLING_POWER_FEATURE.0, PROP_READ);
        cps.add_char(well_known::CYCLING_POWER_CONTROL_POINT.0, PROP_WRITE | PROP_NOTIFY);
        cps.add_char(well_known::SENSOR_LOCATION.0, PROP_READ);

        let mut ftms = Service::new(well_known::FITNESS_MACHINE_SERVICE.0);
        ftms.add_char(well_known::FITNESS_MACHINE_FEATURE.0, PROP_READ);
        ftms.add_char(well_known::INDOOR_BIKE_DATA.0, PROP_NOTIFY);
        ftms.add_char(well_known::TRAINING_STATUS.0, PROP_READ | PROP_NOTIFY);
        ftms.add_char(well_known::FITNESS_MACHINE_CONTROL_POINT.0, PROP_WRITE | PROP_NOTIFY);
        ftms.add_char(well_known::FITNESS_MACHINE_STATUS.0, PROP_NOTIFY);
        ftms.add_char(well_known::SUPPORTED_POWER_RANGE.0, PROP_READ);
        ftms.add_char(well_known::SUPPORTED_RESISTANCE_LEVEL_RANGE.0, PROP_READ);

        GattTable {
            services: vec![cps, ftms],
        }
    }

    pub fn find_service(&self, uuid: &Uuid128) -> Option<&Service> {
        self.services.iter().find(|s| Uuid128::eq(&s.uuid128, uuid))
    }

    /// Linear scan across every service for a characteristic UUID — tables
    /// are small enough that this never needs an index.
    pub fn find_characteristic(&self, uuid: &Uuid128) -> Option<(&Service, &Characteristic)> {
        self.services
            .iter()
            .find_map(|s| s.find_char(uuid).map(|c| (s, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape_matches_spec() {
        let table = GattTable::build();
        assert_eq!(table.services.len(), 2);

        let cps = &table.services[0];
        assert_eq!(cps.uuid128.to_u16(), Some(well_known::CYCLING_POWER_SERVICE.0));
        assert_eq!(cps.characteristics.len(), 4);
        assert_eq!(cps.characteristics[0].properties, PROP_NOTIFY);
        assert_eq!(cps.characteristics[1].properties, PROP_READ);
        assert_eq!(cps.characteristics[2].properties, PROP_WRITE | PROP_NOTIFY);
        assert_eq!(cps.characteristics[3].properties, PROP_READ);

        let ftms = &table.services[1];
        assert_eq!(ftms.uuid128.to_u16(), Some(well_known::FITNESS_MACHINE_SERVICE.0));
        assert_eq!(ftms.characteristics.len(), 7);
    }

    #[test]
    fn find_service_unknown_returns_none() {
        let table = GattTable::build();
        let unknown = Uuid128::from_u16(0xABCD);
        assert!(table.find_service(&unknown).is_none());
    }

    #[test]
    fn find_characteristic_crosses_services() {
        let table = GattTable::build();
        let (svc, chr) = table
            .find_characteristic(&Uuid128::from_u16(well_known::INDOOR_BIKE_DATA.0))
            .expect("IBD characteristic should exist");
        assert_eq!(svc.uuid128.to_u16(), Some(well_known::FITNESS_MACHINE_SERVICE.0));
        assert!(chr.supports(PROP_NOTIFY));
        assert!(!chr.supports(PROP_READ));
    }

    #[test]
    fn discover_order_is_insertion_order() {
        let table = GattTable::build();
        let uuids: Vec<u16> = table.services[1]
            .characteristics
            .iter()
            .map(|c| c.uuid16().unwrap())
            .collect();
        assert_eq!(
            uuids,
            vec![
                well_known::FITNESS_MACHINE_FEATURE.0,
                well_known::INDOOR_BIKE_DATA.0,
                well_known::TRAINING_STATUS.0,
                well_known::FITNESS_MACHINE_CONTROL_POINT.0,
                well_known::FITNESS_MACHINE_STATUS.0,
                well_known::SUPPORTED_POWER_RANGE.0,
                well_known::SUPPORTED_RESISTANCE_LEVEL_RANGE.0,
            ]
        );
    }
}
