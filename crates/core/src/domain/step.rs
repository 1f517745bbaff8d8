use serde::{Deserialize, Serialize};

use super::position::PositionRequest;
use super::sample::SampleType;
use crate::error::{CoreError, Result};

/// Syringe tools mounted on the autosampler head.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Tool {
    #[serde(rename = "LS1")]
    Ls1,
    #[serde(rename = "LS2")]
    Ls2,
    #[serde(rename = "LS3")]
    Ls3,
    #[serde(rename = "HS1")]
    Hs1,
    #[serde(rename = "HS2")]
    Hs2,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ls1 => "LS1",
            Self::Ls2 => "LS2",
            Self::Ls3 => "LS3",
            Self::Hs1 => "HS1",
            Self::Hs2 => "HS2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LS1" => Some(Self::Ls1),
            "LS2" => Some(Self::Ls2),
            "LS3" => Some(Self::Ls3),
            "HS1" => Some(Self::Hs1),
            "HS2" => Some(Self::Hs2),
            _ => None,
        }
    }

    pub fn is_headspace(&self) -> bool {
        matches!(self, Self::Hs1 | Self::Hs2)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WashFlags {
    #[serde(default)]
    pub wash1: bool,
    #[serde(default)]
    pub wash2: bool,
    #[serde(default)]
    pub wash3: bool,
    #[serde(default)]
    pub wash4: bool,
}

impl WashFlags {
    pub fn all() -> Self {
        Self {
            wash1: true,
            wash2: true,
            wash3: true,
            wash4: true,
        }
    }

    pub fn as_array(&self) -> [bool; 4] {
        [self.wash1, self.wash2, self.wash3, self.wash4]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferParams {
    pub source: PositionRequest,
    pub destination: PositionRequest,
    pub volume_ul: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveParams {
    pub source: PositionRequest,
    pub volume_ul: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillParams {
    pub source: PositionRequest,
    /// Custom position receiving the liquid.
    pub destination: String,
    pub volume_ul: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InjectParams {
    pub source: PositionRequest,
    /// Custom position of the analyzer injection port.
    pub injector: String,
    pub volume_ul: f64,
}

/// The closed set of autosampler operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Method {
    Transfer(TransferParams),
    Archive(ArchiveParams),
    Fill(FillParams),
    InjectLiquid(InjectParams),
    InjectGas(InjectParams),
    DeepClean,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "transfer",
            Self::Archive(_) => "archive",
            Self::Fill(_) => "fill",
            Self::InjectLiquid(_) => "inject_liquid",
            Self::InjectGas(_) => "inject_gas",
            Self::DeepClean => "deep_clean",
        }
    }

    /// Instrument method file executed for this operation.
    pub fn method_file(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "lcfc_transfer.cam",
            Self::Archive(_) => "lcfc_archive.cam",
            Self::Fill(_) => "lcfc_fill.cam",
            Self::InjectLiquid(_) => "lcfc_inject_liquid.cam",
            Self::InjectGas(_) => "lcfc_inject_headspace.cam",
            Self::DeepClean => "lcfc_deep_clean.cam",
        }
    }

    /// Type of the sample this operation deposits at its destination.
    pub fn output_type(&self) -> Option<SampleType> {
        match self {
            Self::Transfer(_) | Self::Archive(_) | Self::Fill(_) | Self::InjectLiquid(_) => {
                Some(SampleType::Liquid)
            }
            Self::InjectGas(_) => Some(SampleType::Gas),
            Self::DeepClean => None,
        }
    }

    pub fn source(&self) -> Option<&PositionRequest> {
        match self {
            Self::Transfer(p) => Some(&p.source),
            Self::Archive(p) => Some(&p.source),
            Self::Fill(p) => Some(&p.source),
            Self::InjectLiquid(p) | Self::InjectGas(p) => Some(&p.source),
            Self::DeepClean => None,
        }
    }

    pub fn destination(&self) -> Option<PositionRequest> {
        match self {
            Self::Transfer(p) => Some(p.destination.clone()),
            Self::Archive(_) => Some(PositionRequest::NextEmptyVial),
            Self::Fill(p) => Some(PositionRequest::custom(p.destination.clone())),
            Self::InjectLiquid(p) | Self::InjectGas(p) => {
                Some(PositionRequest::custom(p.injector.clone()))
            }
            Self::DeepClean => None,
        }
    }

    pub fn volume_ul(&self) -> f64 {
        match self {
            Self::Transfer(p) => p.volume_ul,
            Self::Archive(p) => p.volume_ul,
            Self::Fill(p) => p.volume_ul,
            Self::InjectLiquid(p) | Self::InjectGas(p) => p.volume_ul,
            Self::DeepClean => 0.0,
        }
    }
}

fn default_repeat() -> u32 {
    1
}

/// One declarative autosampler request before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroStep {
    pub method: Method,
    pub tool: Tool,
    #[serde(default)]
    pub wash: WashFlags,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

impl MicroStep {
    pub fn new(method: Method, tool: Tool) -> Self {
        Self {
            method,
            tool,
            wash: WashFlags::default(),
            repeat: 1,
        }
    }

    pub fn with_wash(mut self, wash: WashFlags) -> Self {
        self.wash = wash;
        self
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Requested volume converted to millilitres.
    pub fn volume_ml(&self) -> Result<f64> {
        ul_to_ml(self.method.volume_ul())
    }

    pub fn validate(&self) -> Result<()> {
        if self.repeat == 0 {
            return Err(CoreError::Validation(format!(
                "{} step must run at least once",
                self.method.name()
            )));
        }
        let volume = self.volume_ml()?;
        if self.method.output_type().is_some() && volume <= 0.0 {
            return Err(CoreError::Validation(format!(
                "{} step needs a positive volume",
                self.method.name()
            )));
        }
        Ok(())
    }
}

pub fn ul_to_ml(volume_ul: f64) -> Result<f64> {
    if !volume_ul.is_finite() || volume_ul < 0.0 {
        return Err(CoreError::Numerical(format!(
            "invalid volume {} uL",
            volume_ul
        )));
    }
    Ok(volume_ul / 1000.0)
}
