use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Solid,
    Liquid,
    Gas,
    Assembly,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solid => "solid",
            Self::Liquid => "liquid",
            Self::Gas => "gas",
            Self::Assembly => "assembly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "solid" => Some(Self::Solid),
            "liquid" => Some(Self::Liquid),
            "gas" => Some(Self::Gas),
            "assembly" => Some(Self::Assembly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Created,
    Preserved,
    Destroyed,
    Incorporated,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preserved => "preserved",
            Self::Destroyed => "destroyed",
            Self::Incorporated => "incorporated",
        }
    }
}

/// Whether a sample's pre-operation state stays visible after an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Inheritance {
    GiveOnly,
    ReceiveOnly,
    AllowBoth,
    #[serde(rename = "none")]
    Neither,
}

impl Inheritance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GiveOnly => "give_only",
            Self::ReceiveOnly => "receive_only",
            Self::AllowBoth => "allow_both",
            Self::Neither => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub chemical: String,
    pub partial_molarity: f64,
}

impl Component {
    pub fn new(chemical: impl Into<String>, partial_molarity: f64) -> Self {
        Self {
            chemical: chemical.into(),
            partial_molarity,
        }
    }
}

/// Fields shared by every sample variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleMeta {
    /// Local identity used to track a sample through a job before the
    /// ledger assigns its global label.
    #[serde(default = "Uuid::new_v4")]
    pub handle: Uuid,
    pub global_label: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub composition: Vec<Component>,
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Vec<SampleStatus>,
    #[serde(default)]
    pub inheritance: Option<Inheritance>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl SampleMeta {
    pub fn new() -> Self {
        Self {
            handle: Uuid::new_v4(),
            global_label: None,
            machine_name: None,
            composition: Vec::new(),
            source: Vec::new(),
            created_at: None,
            status: Vec::new(),
            inheritance: None,
            comment: None,
        }
    }
}

impl Default for SampleMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolidSample {
    pub meta: SampleMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidSample {
    pub meta: SampleMeta,
    pub volume_ml: f64,
    #[serde(default = "unit_factor")]
    pub dilution_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasSample {
    pub meta: SampleMeta,
    pub volume_ml: f64,
    #[serde(default = "unit_factor")]
    pub dilution_factor: f64,
}

fn unit_factor() -> f64 {
    1.0
}

/// A composite sample identified by its ordered parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "AssemblyFields")]
pub struct AssemblySample {
    pub meta: SampleMeta,
    parts: Vec<Sample>,
}

/// Stored form of an assembly, checked by [`AssemblySample::new`] on load.
#[derive(Deserialize)]
struct AssemblyFields {
    meta: SampleMeta,
    parts: Vec<Sample>,
}

impl TryFrom<AssemblyFields> for AssemblySample {
    type Error = CoreError;

    fn try_from(fields: AssemblyFields) -> Result<Self> {
        Self::new(fields.meta, fields.parts)
    }
}

impl AssemblySample {
    /// Build an assembly, rejecting any part tree that refers back to the
    /// assembly itself or repeats a sample.
    pub fn new(meta: SampleMeta, parts: Vec<Sample>) -> Result<Self> {
        let mut assembly = Self {
            meta,
            parts: Vec::new(),
        };
        for part in parts {
            assembly.push_part(part)?;
        }
        Ok(assembly)
    }

    pub fn parts(&self) -> &[Sample] {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut [Sample] {
        &mut self.parts
    }

    pub fn push_part(&mut self, part: Sample) -> Result<()> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        seen.insert(self.meta.handle);
        for existing in &self.parts {
            existing.collect_handles(&mut seen);
        }

        let mut incoming = Vec::new();
        part.collect_handle_list(&mut incoming);
        for handle in incoming {
            if !seen.insert(handle) {
                return Err(CoreError::AssemblyCycle(part.describe()));
            }
        }

        if let (Some(own), Some(label)) = (self.meta.global_label.as_deref(), part.label()) {
            if own == label {
                return Err(CoreError::AssemblyCycle(label.to_string()));
            }
        }

        self.parts.push(part);
        Ok(())
    }

    /// Index of the first part of the given type.
    pub fn part_index(&self, sample_type: SampleType) -> Option<usize> {
        self.parts
            .iter()
            .position(|p| p.sample_type() == sample_type)
    }
}

/// A physical sample tracked by the ledger and registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "sample_type", rename_all = "snake_case")]
pub enum Sample {
    Solid(SolidSample),
    Liquid(LiquidSample),
    Gas(GasSample),
    Assembly(AssemblySample),
}

impl Sample {
    pub fn liquid(volume_ml: f64, composition: Vec<Component>) -> Self {
        let mut meta = SampleMeta::new();
        meta.composition = composition;
        Self::Liquid(LiquidSample {
            meta,
            volume_ml,
            dilution_factor: 1.0,
        })
    }

    pub fn gas(volume_ml: f64, composition: Vec<Component>) -> Self {
        let mut meta = SampleMeta::new();
        meta.composition = composition;
        Self::Gas(GasSample {
            meta,
            volume_ml,
            dilution_factor: 1.0,
        })
    }

    pub fn solid(composition: Vec<Component>) -> Self {
        let mut meta = SampleMeta::new();
        meta.composition = composition;
        Self::Solid(SolidSample { meta })
    }

    /// Unlabeled sample of the given type, used as a placeholder until the
    /// ledger persists it. Assemblies cannot be created this way.
    pub fn reference(sample_type: SampleType, volume_ml: f64) -> Result<Self> {
        match sample_type {
            SampleType::Liquid => Ok(Self::liquid(volume_ml, Vec::new())),
            SampleType::Gas => Ok(Self::gas(volume_ml, Vec::new())),
            SampleType::Solid => Ok(Self::solid(Vec::new())),
            SampleType::Assembly => Err(CoreError::Validation(
                "assembly reference samples must be built from parts".to_string(),
            )),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.meta_mut().global_label = Some(label.into());
        self
    }

    pub fn sample_type(&self) -> SampleType {
        match self {
            Self::Solid(_) => SampleType::Solid,
            Self::Liquid(_) => SampleType::Liquid,
            Self::Gas(_) => SampleType::Gas,
            Self::Assembly(_) => SampleType::Assembly,
        }
    }

    pub fn meta(&self) -> &SampleMeta {
        match self {
            Self::Solid(s) => &s.meta,
            Self::Liquid(s) => &s.meta,
            Self::Gas(s) => &s.meta,
            Self::Assembly(s) => &s.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut SampleMeta {
        match self {
            Self::Solid(s) => &mut s.meta,
            Self::Liquid(s) => &mut s.meta,
            Self::Gas(s) => &mut s.meta,
            Self::Assembly(s) => &mut s.meta,
        }
    }

    pub fn handle(&self) -> Uuid {
        self.meta().handle
    }

    pub fn label(&self) -> Option<&str> {
        self.meta().global_label.as_deref()
    }

    pub fn is_labeled(&self) -> bool {
        self.meta().global_label.is_some()
    }

    /// Label if assigned, otherwise the local handle.
    pub fn describe(&self) -> String {
        match self.label() {
            Some(label) => label.to_string(),
            None => format!("{}#{}", self.sample_type().as_str(), self.handle()),
        }
    }

    pub fn volume_ml(&self) -> Option<f64> {
        match self {
            Self::Liquid(s) => Some(s.volume_ml),
            Self::Gas(s) => Some(s.volume_ml),
            Self::Solid(_) | Self::Assembly(_) => None,
        }
    }

    /// Volume and dilution factor, for variants that carry them.
    pub fn volume_parts_mut(&mut self) -> Option<(&mut f64, &mut f64)> {
        match self {
            Self::Liquid(s) => Some((&mut s.volume_ml, &mut s.dilution_factor)),
            Self::Gas(s) => Some((&mut s.volume_ml, &mut s.dilution_factor)),
            Self::Solid(_) | Self::Assembly(_) => None,
        }
    }

    pub fn has_status(&self, status: SampleStatus) -> bool {
        self.meta().status.contains(&status)
    }

    pub fn add_status(&mut self, status: SampleStatus) {
        let meta = self.meta_mut();
        if !meta.status.contains(&status) {
            meta.status.push(status);
        }
    }

    pub fn as_assembly(&self) -> Option<&AssemblySample> {
        match self {
            Self::Assembly(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_assembly_mut(&mut self) -> Option<&mut AssemblySample> {
        match self {
            Self::Assembly(a) => Some(a),
            _ => None,
        }
    }

    /// Find this sample or one of its parts by handle.
    pub fn find(&self, handle: Uuid) -> Option<&Sample> {
        if self.handle() == handle {
            return Some(self);
        }
        match self {
            Self::Assembly(a) => a.parts.iter().find_map(|p| p.find(handle)),
            _ => None,
        }
    }

    pub fn find_mut(&mut self, handle: Uuid) -> Option<&mut Sample> {
        if self.handle() == handle {
            return Some(self);
        }
        match self {
            Self::Assembly(a) => a.parts.iter_mut().find_map(|p| p.find_mut(handle)),
            _ => None,
        }
    }

    /// Visit this sample and every nested part, parents first.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Sample)) {
        f(self);
        if let Self::Assembly(a) = self {
            for part in a.parts.iter_mut() {
                part.for_each_mut(f);
            }
        }
    }

    /// Replace this sample (or any nested part) carrying the same handle as
    /// `replacement`. Returns whether a replacement happened.
    pub fn replace(&mut self, replacement: &Sample) -> bool {
        if self.handle() == replacement.handle() {
            *self = replacement.clone();
            return true;
        }
        match self {
            Self::Assembly(a) => a.parts.iter_mut().any(|p| p.replace(replacement)),
            _ => false,
        }
    }

    fn collect_handles(&self, into: &mut HashSet<Uuid>) {
        into.insert(self.handle());
        if let Self::Assembly(a) = self {
            for part in &a.parts {
                part.collect_handles(into);
            }
        }
    }

    fn collect_handle_list(&self, into: &mut Vec<Uuid>) {
        into.push(self.handle());
        if let Self::Assembly(a) = self {
            for part in &a.parts {
                part.collect_handle_list(into);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_sample() {
        let sample = Sample::reference(SampleType::Liquid, 0.2).unwrap();
        assert_eq!(sample.sample_type(), SampleType::Liquid);
        assert_eq!(sample.volume_ml(), Some(0.2));
        assert!(!sample.is_labeled());
        assert!(Sample::reference(SampleType::Assembly, 0.0).is_err());
    }

    #[test]
    fn test_assembly_rejects_self_reference() {
        let liquid = Sample::liquid(1.0, Vec::new());
        let mut assembly = AssemblySample::new(SampleMeta::new(), vec![liquid.clone()]).unwrap();

        let err = assembly.push_part(liquid).unwrap_err();
        assert!(matches!(err, CoreError::AssemblyCycle(_)));
    }

    #[test]
    fn test_assembly_rejects_own_handle() {
        let meta = SampleMeta::new();
        let mut nested = Sample::solid(Vec::new());
        nested.meta_mut().handle = meta.handle;

        let err = AssemblySample::new(meta, vec![nested]).unwrap_err();
        assert!(matches!(err, CoreError::AssemblyCycle(_)));
    }

    #[test]
    fn test_deserialize_rejects_repeated_part() {
        let liquid = Sample::liquid(1.0, Vec::new());
        let assembly = Sample::Assembly(
            AssemblySample::new(SampleMeta::new(), vec![liquid.clone()]).unwrap(),
        );

        let mut value = serde_json::to_value(&assembly).unwrap();
        let parts = value["parts"].as_array_mut().unwrap();
        parts.push(serde_json::to_value(&liquid).unwrap());

        let err = serde_json::from_value::<Sample>(value).unwrap_err();
        assert!(err.to_string().contains("own ancestor"));
    }

    #[test]
    fn test_deserialize_assembly_roundtrip() {
        let assembly = Sample::Assembly(
            AssemblySample::new(
                SampleMeta::new(),
                vec![Sample::solid(Vec::new()), Sample::liquid(0.2, Vec::new())],
            )
            .unwrap(),
        );

        let json = serde_json::to_string(&assembly).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, assembly);
    }

    #[test]
    fn test_assembly_part_index() {
        let assembly = AssemblySample::new(
            SampleMeta::new(),
            vec![Sample::solid(Vec::new()), Sample::liquid(1.0, Vec::new())],
        )
        .unwrap();

        assert_eq!(assembly.part_index(SampleType::Liquid), Some(1));
        assert_eq!(assembly.part_index(SampleType::Gas), None);
    }

    #[test]
    fn test_replace_nested_part() {
        let liquid = Sample::liquid(1.0, Vec::new());
        let mut sample = Sample::Assembly(
            AssemblySample::new(
                SampleMeta::new(),
                vec![Sample::solid(Vec::new()), liquid.clone()],
            )
            .unwrap(),
        );

        let mut updated = liquid.clone();
        if let Some((volume, _)) = updated.volume_parts_mut() {
            *volume = 3.0;
        }

        assert!(sample.replace(&updated));
        assert_eq!(sample.find(liquid.handle()).and_then(|s| s.volume_ml()), Some(3.0));
    }

    #[test]
    fn test_status_is_deduplicated() {
        let mut sample = Sample::liquid(1.0, Vec::new());
        sample.add_status(SampleStatus::Created);
        sample.add_status(SampleStatus::Created);
        assert_eq!(sample.meta().status, vec![SampleStatus::Created]);
    }

    #[test]
    fn test_sample_serialization() {
        let sample = Sample::liquid(0.5, vec![Component::new("KOH", 1.0)]).with_label("lab__liquid__3");

        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"sample_type\":\"liquid\""));

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
