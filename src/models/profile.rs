// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application profile (one row per auth user) and self-service edits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Display name used when an email has no usable local part.
pub const DEFAULT_DISPLAY_NAME: &str = "Usuário";

/// Permission tier stored on the profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Cliente,
    Admin,
    Trainer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cliente => "cliente",
            Role::Admin => "admin",
            Role::Trainer => "trainer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cliente" => Ok(Role::Cliente),
            "admin" => Ok(Role::Admin),
            "trainer" => Ok(Role::Trainer),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Row of the `profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct Profile {
    /// Same value as the auth user id
    pub id: String,
    #[serde(default)]
    pub email: String,
    /// Display name
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plano_ativo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objetivo: Option<String>,
    /// Height in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altura: Option<f64>,
    /// Starting weight in kg
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peso_inicial: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condicoes_saude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_nascimento: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telefone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Profile {
    /// Minimal profile used when no stored row can be obtained.
    ///
    /// This is the one place profiles are synthesized: display name from the
    /// email's local part, role `cliente`, no domain attributes.
    pub fn fallback(user_id: &str, email: &str) -> Self {
        Self {
            id: user_id.to_string(),
            email: email.to_string(),
            nome: Some(display_name_from_email(email)),
            role: Role::Cliente,
            plano_ativo: None,
            objetivo: None,
            altura: None,
            peso_inicial: None,
            condicoes_saude: None,
            data_nascimento: None,
            telefone: None,
            created_at: None,
        }
    }

    /// A profile is complete once it has a name and a goal.
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.nome) && filled(&self.objetivo)
    }
}

/// Local part of an email address, or the default display name.
pub fn display_name_from_email(email: &str) -> String {
    match email.split('@').next() {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => DEFAULT_DISPLAY_NAME.to_string(),
    }
}

/// Self-service profile edit as submitted by the dashboard forms.
///
/// Accepts both the English form names and the column names.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ProfileUpdate {
    #[serde(default, alias = "full_name")]
    #[validate(length(max = 120, message = "Nome muito longo"))]
    pub nome: Option<String>,
    #[serde(default, alias = "birth_date")]
    pub data_nascimento: Option<String>,
    #[serde(default, alias = "phone")]
    #[validate(length(max = 30, message = "Telefone inválido"))]
    pub telefone: Option<String>,
    #[serde(default, alias = "goal")]
    #[validate(length(max = 500))]
    pub objetivo: Option<String>,
    /// Height in centimeters (form input)
    #[serde(default)]
    #[validate(range(min = 50.0, max = 260.0, message = "Altura inválida"))]
    pub height: Option<f64>,
    /// Height in meters (column value)
    #[serde(default)]
    #[validate(range(min = 0.5, max = 2.6, message = "Altura inválida"))]
    pub altura: Option<f64>,
    #[serde(default, alias = "weight")]
    #[validate(range(min = 20.0, max = 400.0, message = "Peso inválido"))]
    pub peso_inicial: Option<f64>,
    #[serde(default, alias = "health_conditions")]
    #[validate(length(max = 2000))]
    pub condicoes_saude: Option<String>,
}

impl ProfileUpdate {
    /// Map to column changes, dropping blank values.
    pub fn into_changes(self) -> ProfileChanges {
        let text = |v: Option<String>| {
            v.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        ProfileChanges {
            nome: text(self.nome),
            data_nascimento: text(self.data_nascimento),
            telefone: text(self.telefone),
            objetivo: text(self.objetivo),
            altura: self.height.map(|cm| cm / 100.0).or(self.altura),
            peso_inicial: self.peso_inicial,
            condicoes_saude: text(self.condicoes_saude),
        }
    }
}

/// Column changes sent to the profile store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_nascimento: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objetivo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altura: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peso_inicial: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condicoes_saude: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        *self == ProfileChanges::default()
    }

    /// Apply the changes to an in-memory profile.
    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(v) = &self.nome {
            profile.nome = Some(v.clone());
        }
        if let Some(v) = &self.data_nascimento {
            profile.data_nascimento = Some(v.clone());
        }
        if let Some(v) = &self.telefone {
            profile.telefone = Some(v.clone());
        }
        if let Some(v) = &self.objetivo {
            profile.objetivo = Some(v.clone());
        }
        if let Some(v) = self.altura {
            profile.altura = Some(v);
        }
        if let Some(v) = self.peso_inicial {
            profile.peso_inicial = Some(v);
        }
        if let Some(v) = &self.condicoes_saude {
            profile.condicoes_saude = Some(v.clone());
        }
    }
}
