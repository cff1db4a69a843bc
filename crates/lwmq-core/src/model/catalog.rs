// ── Object / resource name catalog ──
//
// Bidirectional id <-> name tables for a fixed set of objects. Tree keys
// are canonicalized through the catalog: a known id becomes its name, an
// unknown id stays as its numeric string, and names pass through.

use std::collections::HashMap;

use crate::error::CoreError;

/// Names for a single object and its resources.
#[derive(Debug, Clone, Default)]
struct ObjectDef {
    name: String,
    resource_names: HashMap<u16, String>,
    resource_ids: HashMap<String, u16>,
}

/// Bidirectional name table for objects and their resources.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    objects: HashMap<u16, ObjectDef>,
    object_ids: HashMap<String, u16>,
}

/// A parsed `oid[/iid[/rid]]` path with canonical keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    pub oid: String,
    pub iid: Option<u16>,
    pub rid: Option<String>,
}

impl ResourcePath {
    pub fn object(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            iid: None,
            rid: None,
        }
    }

    pub fn instance(oid: impl Into<String>, iid: u16) -> Self {
        Self {
            oid: oid.into(),
            iid: Some(iid),
            rid: None,
        }
    }

    pub fn resource(oid: impl Into<String>, iid: u16, rid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            iid: Some(iid),
            rid: Some(rid.into()),
        }
    }

    /// Dotted path of this location inside a persisted device record.
    pub fn store_path(&self) -> String {
        let mut path = format!("resourceTree.{}", self.oid);
        if let Some(iid) = self.iid {
            path.push_str(&format!(".{iid}"));
        }
        if let Some(rid) = &self.rid {
            path.push('.');
            path.push_str(rid);
        }
        path
    }
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.oid)?;
        if let Some(iid) = self.iid {
            write!(f, "/{iid}")?;
        }
        if let Some(rid) = &self.rid {
            write!(f, "/{rid}")?;
        }
        Ok(())
    }
}

impl Catalog {
    /// Empty catalog: every id passes through as its numeric string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an object definition.
    pub fn with_object<'a>(
        mut self,
        oid: u16,
        name: &str,
        resources: impl IntoIterator<Item = (u16, &'a str)>,
    ) -> Self {
        self.insert_object(oid, name, resources);
        self
    }

    pub fn insert_object<'a>(
        &mut self,
        oid: u16,
        name: &str,
        resources: impl IntoIterator<Item = (u16, &'a str)>,
    ) {
        if let Some(old) = self.objects.remove(&oid) {
            self.object_ids.remove(&old.name);
        }
        let mut def = ObjectDef {
            name: name.to_owned(),
            ..ObjectDef::default()
        };
        for (rid, rname) in resources {
            def.resource_names.insert(rid, rname.to_owned());
            def.resource_ids.insert(rname.to_owned(), rid);
        }
        self.object_ids.insert(name.to_owned(), oid);
        self.objects.insert(oid, def);
    }

    /// Add resource names to an object already in the catalog.
    pub fn extend_resources<'a>(
        &mut self,
        oid: u16,
        resources: impl IntoIterator<Item = (u16, &'a str)>,
    ) -> bool {
        let Some(def) = self.objects.get_mut(&oid) else {
            return false;
        };
        for (rid, rname) in resources {
            def.resource_names.insert(rid, rname.to_owned());
            def.resource_ids.insert(rname.to_owned(), rid);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The core LWM2M objects (0–7) plus a few common IPSO objects.
    pub fn lwm2m_core() -> Self {
        Self::new()
            .with_object(
                0,
                "lwm2mSecurity",
                [
                    (0, "lwm2mServerURI"),
                    (1, "bootstrapServer"),
                    (2, "securityMode"),
                    (10, "shortServerId"),
                ],
            )
            .with_object(
                1,
                "lwm2mServer",
                [
                    (0, "shortServerId"),
                    (1, "lifetime"),
                    (2, "defaultMinPeriod"),
                    (3, "defaultMaxPeriod"),
                    (4, "disable"),
                    (6, "notificationStoring"),
                    (7, "binding"),
                    (8, "regUpdateTrigger"),
                ],
            )
            .with_object(
                2,
                "accessCtrl",
                [(0, "objectId"), (1, "objectInstanceId"), (2, "ACL"), (3, "ACLOwner")],
            )
            .with_object(
                3,
                "device",
                [
                    (0, "manuf"),
                    (1, "model"),
                    (2, "serial"),
                    (3, "firmwareVer"),
                    (4, "reboot"),
                    (5, "factoryReset"),
                    (6, "availPwrSrc"),
                    (7, "pwrSrcVoltage"),
                    (8, "pwrSrcCurrent"),
                    (9, "battLevel"),
                    (10, "memFree"),
                    (11, "errCode"),
                    (12, "resetErrCode"),
                    (13, "currentTime"),
                    (14, "UTCOffset"),
                    (15, "timezone"),
                    (16, "supportedBindAndModes"),
                    (17, "devType"),
                    (18, "hwVer"),
                    (19, "swVer"),
                    (20, "battStatus"),
                    (21, "memTotal"),
                ],
            )
            .with_object(
                4,
                "connMonitor",
                [
                    (0, "networkBearer"),
                    (1, "availNetworkBearer"),
                    (2, "radioSignalStrength"),
                    (3, "linkQuality"),
                    (4, "ip"),
                    (5, "routeIp"),
                    (6, "linkUtilization"),
                ],
            )
            .with_object(
                5,
                "firmware",
                [
                    (0, "package"),
                    (1, "packageURI"),
                    (2, "update"),
                    (3, "state"),
                    (5, "updateResult"),
                ],
            )
            .with_object(
                6,
                "location",
                [
                    (0, "lat"),
                    (1, "lon"),
                    (2, "alt"),
                    (3, "uncertainty"),
                    (4, "velocity"),
                    (5, "timestamp"),
                ],
            )
            .with_object(
                7,
                "connStatistics",
                [
                    (0, "SMSTxCounter"),
                    (1, "SMSRxCounter"),
                    (2, "txData"),
                    (3, "rxData"),
                    (4, "maxMsgSize"),
                    (5, "avgMsgSize"),
                    (6, "startOrReset"),
                ],
            )
            .with_object(
                3303,
                "temperature",
                [
                    (5601, "minMeaValue"),
                    (5602, "maxMeaValue"),
                    (5603, "minRangeValue"),
                    (5604, "maxRangeValue"),
                    (5605, "resetMinMaxMeaValues"),
                    (5700, "sensorValue"),
                    (5701, "units"),
                ],
            )
            .with_object(
                3304,
                "humidity",
                [
                    (5601, "minMeaValue"),
                    (5602, "maxMeaValue"),
                    (5700, "sensorValue"),
                    (5701, "units"),
                ],
            )
            .with_object(
                3311,
                "lightCtrl",
                [
                    (5701, "units"),
                    (5706, "colour"),
                    (5805, "cumulActivePwr"),
                    (5820, "powerFactor"),
                    (5850, "onOff"),
                    (5851, "dimmer"),
                    (5852, "onTime"),
                ],
            )
    }

    // ── Key canonicalization ─────────────────────────────────────────

    /// Canonical tree key for an object given by id or name.
    pub fn oid_key(&self, raw: &str) -> String {
        match raw.parse::<u16>() {
            Ok(id) => self
                .objects
                .get(&id)
                .map_or_else(|| raw.to_owned(), |def| def.name.clone()),
            Err(_) => raw.to_owned(),
        }
    }

    /// Numeric object id for a canonical key, if it has one.
    pub fn oid_number(&self, key: &str) -> Option<u16> {
        key.parse::<u16>()
            .ok()
            .or_else(|| self.object_ids.get(key).copied())
    }

    /// Canonical tree key for a resource of `oid_key`, given by id or name.
    pub fn rid_key(&self, oid_key: &str, raw: &str) -> String {
        let Ok(rid) = raw.parse::<u16>() else {
            return raw.to_owned();
        };
        self.object_def(oid_key)
            .and_then(|def| def.resource_names.get(&rid))
            .map_or_else(|| raw.to_owned(), Clone::clone)
    }

    /// Numeric resource id for a canonical key, if it has one.
    pub fn rid_number(&self, oid_key: &str, key: &str) -> Option<u16> {
        key.parse::<u16>().ok().or_else(|| {
            self.object_def(oid_key)
                .and_then(|def| def.resource_ids.get(key).copied())
        })
    }

    fn object_def(&self, oid_key: &str) -> Option<&ObjectDef> {
        self.oid_number(oid_key).and_then(|id| self.objects.get(&id))
    }

    // ── Path parsing ─────────────────────────────────────────────────

    /// Parse `oid[/iid[/rid]]` or `oid[.iid[.rid]]` into canonical keys.
    /// A leading delimiter is allowed; mixing delimiters is not.
    pub fn parse_path(&self, raw: &str) -> Result<ResourcePath, CoreError> {
        let invalid = || CoreError::InvalidPath {
            path: raw.to_owned(),
        };

        let delimiter = if raw.contains('/') { '/' } else { '.' };
        let trimmed = raw.strip_prefix(delimiter).unwrap_or(raw);
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let segments: Vec<&str> = trimmed.split(delimiter).collect();
        if segments.len() > 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        let oid = self.oid_key(segments[0]);
        let iid = match segments.get(1) {
            Some(raw_iid) => Some(raw_iid.parse::<u16>().map_err(|_| invalid())?),
            None => None,
        };
        let rid = segments.get(2).map(|raw_rid| self.rid_key(&oid, raw_rid));

        Ok(ResourcePath { oid, iid, rid })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_delimiter_conventions() {
        let catalog = Catalog::lwm2m_core();
        let slash = catalog.parse_path("/3/0/0").unwrap();
        let dot = catalog.parse_path("device.0.manuf").unwrap();
        assert_eq!(slash, dot);
        assert_eq!(slash, ResourcePath::resource("device", 0, "manuf"));
    }

    #[test]
    fn unknown_ids_stay_numeric() {
        let catalog = Catalog::new();
        let path = catalog.parse_path("3/0/manuf").unwrap();
        assert_eq!(path, ResourcePath::resource("3", 0, "manuf"));
        assert_eq!(path.to_string(), "3/0/manuf");
        assert_eq!(path.store_path(), "resourceTree.3.0.manuf");
    }

    #[test]
    fn rejects_bad_paths() {
        let catalog = Catalog::lwm2m_core();
        for raw in ["", "/", "3/x", "3/0/1/2", "3//1", "3/70000"] {
            assert!(
                matches!(catalog.parse_path(raw), Err(CoreError::InvalidPath { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn numbers_round_trip_through_names() {
        let catalog = Catalog::lwm2m_core();
        assert_eq!(catalog.oid_number("temperature"), Some(3303));
        assert_eq!(catalog.rid_number("temperature", "sensorValue"), Some(5700));
        assert_eq!(catalog.rid_key("3303", "5700"), "sensorValue");
        assert_eq!(catalog.oid_number("vendorThing"), None);
    }

    #[test]
    fn replacing_an_object_drops_its_old_name() {
        let mut catalog = Catalog::new().with_object(9000, "widget", [(1, "knob")]);
        catalog.insert_object(9000, "gadget", [(1, "dial")]);
        assert_eq!(catalog.oid_number("widget"), None);
        assert_eq!(catalog.oid_key("9000"), "gadget");
        assert_eq!(catalog.rid_key("gadget", "1"), "dial");
    }
}
