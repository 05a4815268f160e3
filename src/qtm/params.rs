//! # QTM parameters
//!
//! Subset of the `GetParameters General 6D` XML answer: capture frequency, rigid body names and
//! the Euler angle convention.

use std::fmt::Display;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::{QtmError, Result};

/// Axes of the Euler angles, in the order they are applied
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EulerConvention {
    /// First rotation axis
    pub first: String,
    /// Second rotation axis
    pub second: String,
    /// Third rotation axis
    pub third: String,
}

impl EulerConvention {
    /// Yaw, then pitch, then roll: the convention of the Crazyflie
    pub fn is_zyx(&self) -> bool {
        [&self.first, &self.second, &self.third]
            .iter()
            .zip(["Z", "Y", "X"])
            .all(|(axis, expected)| axis.eq_ignore_ascii_case(expected))
    }
}

impl Display for EulerConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.first, self.second, self.third)
    }
}

/// Parameters of the running QTM measurement
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QtmParameters {
    /// Capture frequency, Hz
    pub frequency: Option<u32>,
    /// Names of the rigid bodies, in the order they appear in 6D frames
    pub bodies: Vec<String>,
    /// Euler angle convention, if the 6D settings carry one
    pub euler: Option<EulerConvention>,
}

impl QtmParameters {
    /// Parse the XML answer to `GetParameters`
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut params = QtmParameters::default();
        let mut euler = EulerConvention::default();
        let mut has_euler = false;
        let mut path: Vec<String> = Vec::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    path.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
                }
                Ok(Event::End(_)) => {
                    path.pop();
                }
                Ok(Event::Text(ref e)) => {
                    let text = e.unescape()?.trim().to_string();
                    // Skip the root element, its name carries the protocol version
                    let tail: Vec<&str> = path.iter().skip(1).map(String::as_str).collect();
                    match tail.as_slice() {
                        ["General", "Frequency"] => {
                            let frequency = text
                                .parse()
                                .map_err(|_| QtmError::Malformed(format!("invalid frequency '{}'", text)))?;
                            params.frequency = Some(frequency);
                        }
                        ["The_6D", "Body", "Name"] => params.bodies.push(text),
                        ["The_6D", "Euler", axis] => {
                            has_euler = true;
                            match *axis {
                                "First" => euler.first = text,
                                "Second" => euler.second = text,
                                "Third" => euler.third = text,
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(e.into()),
                _ => {}
            }
            buf.clear();
        }

        if has_euler {
            params.euler = Some(euler);
        }

        Ok(params)
    }

    /// Index of a body in the 6D component
    pub fn body_index(&self, name: &str) -> Option<usize> {
        self.bodies.iter().position(|b| b == name)
    }

    /// One line per body, `(index) name`, indexed like the 6D component
    pub fn body_listing(&self) -> Vec<String> {
        self.bodies.iter().enumerate().map(|(index, name)| format!("({}) {}", index, name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::qtm_parameters_xml;

    #[test]
    fn parses_frequency_bodies_and_euler() {
        let params = QtmParameters::parse(&qtm_parameters_xml(100, &["Crazyflie", "Tiara"])).unwrap();
        assert_eq!(params.frequency, Some(100));
        assert_eq!(params.bodies, vec!["Crazyflie", "Tiara"]);
        assert_eq!(params.body_index("Tiara"), Some(1));
        assert_eq!(params.body_index("car"), None);
        let euler = params.euler.unwrap();
        assert!(euler.is_zyx());
        assert_eq!(euler.to_string(), "Z/Y/X");
    }

    #[test]
    fn bodies_are_listed_in_component_order() {
        let params = QtmParameters::parse(&qtm_parameters_xml(100, &["Crazyflie", "Tiara"])).unwrap();
        assert_eq!(params.body_listing(), vec!["(0) Crazyflie", "(1) Tiara"]);
    }

    #[test]
    fn missing_sections_are_empty() {
        let params = QtmParameters::parse("<QTM_Parameters_Ver_1.17><General></General></QTM_Parameters_Ver_1.17>").unwrap();
        assert_eq!(params, QtmParameters::default());
    }

    #[test]
    fn other_conventions_are_not_zyx() {
        let xml = "<P><The_6D><Euler><First>X</First><Second>Y</Second><Third>Z</Third></Euler></The_6D></P>";
        let params = QtmParameters::parse(xml).unwrap();
        assert!(!params.euler.unwrap().is_zyx());
    }

    #[test]
    fn invalid_frequency_is_an_error() {
        let xml = "<P><General><Frequency>fast</Frequency></General></P>";
        assert!(QtmParameters::parse(xml).is_err());
    }
}
